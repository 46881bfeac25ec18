//! Effective-id switching around report writes
//!
//! Measuring needs root, but report files belong to whoever ran `sudo`.
//! [`ReportPrivileges::as_invoking_user`] switches the effective uid/gid to
//! `SUDO_UID`/`SUDO_GID`; the returned guard switches back.

use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use tracing::{debug, warn};

/// Parse the invoking user's ids from the sudo environment
pub fn sudo_ids(uid: Option<&str>, gid: Option<&str>) -> Option<(Uid, Gid)> {
    let uid = uid?.trim().parse().ok()?;
    let gid = gid?.trim().parse().ok()?;
    Some((Uid::from_raw(uid), Gid::from_raw(gid)))
}

/// Restores the saved effective ids when dropped
#[derive(Debug)]
#[must_use = "privileges are restored when the guard is dropped"]
pub struct ReportPrivileges {
    saved: Option<(Uid, Gid)>,
}

impl ReportPrivileges {
    /// Become the invoking user if running as root under sudo
    pub fn as_invoking_user() -> Self {
        let euid = geteuid();
        if !euid.is_root() {
            return Self { saved: None };
        }
        let uid = std::env::var("SUDO_UID").ok();
        let gid = std::env::var("SUDO_GID").ok();
        let Some((uid, gid)) = sudo_ids(uid.as_deref(), gid.as_deref()) else {
            warn!("Unable to drop privileges before saving reports");
            return Self { saved: None };
        };

        let saved = (euid, getegid());
        // Group first: once the uid is dropped setegid is no longer allowed
        if let Err(e) = setegid(gid) {
            warn!("Unable to drop privileges before saving reports: {}", e);
            return Self { saved: None };
        }
        if let Err(e) = seteuid(uid) {
            warn!("Unable to drop privileges before saving reports: {}", e);
            let _ = setegid(saved.1);
            return Self { saved: None };
        }
        debug!("Writing reports as uid {} gid {}", uid, gid);
        Self { saved: Some(saved) }
    }

    pub fn dropped(&self) -> bool {
        self.saved.is_some()
    }
}

impl Drop for ReportPrivileges {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.saved.take() {
            if let Err(e) = seteuid(uid) {
                warn!("Failed to restore effective uid {}: {}", uid, e);
            }
            if let Err(e) = setegid(gid) {
                warn!("Failed to restore effective gid {}: {}", gid, e);
            }
        }
    }
}
