//! Event records delivered to the engine hooks
//!
//! Each record mirrors one kernel event: `raw_syscalls:sys_enter`,
//! `raw_syscalls:sys_exit`, `sched:sched_process_fork` and
//! `sched:sched_process_exit`. The event source stamps the processor and the
//! monotonic time, so every hook is a pure function of the event and the
//! engine state.

use serde::{Deserialize, Serialize};

/// Thread id and thread-group id packed the way `bpf_get_current_pid_tgid`
/// returns them: thread-group id in the upper 32 bits, thread id in the lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PidTgid(u64);

impl PidTgid {
    /// Pack a thread-group id and a thread id
    pub const fn new(tgid: u32, tid: u32) -> Self {
        Self(((tgid as u64) << 32) | tid as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Process (thread-group) id
    pub const fn tgid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Thread id
    pub const fn tid(self) -> u32 {
        (self.0 & u32::MAX as u64) as u32
    }

    /// An all-zero identity never belongs to a traceable caller.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PidTgid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tgid(), self.tid())
    }
}

/// Syscall entry on `cpu` at `ktime_ns`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysEnter {
    pub cpu: u32,
    pub caller: PidTgid,
    pub ktime_ns: u64,
    /// Syscall number. The entry hook does not need it; kept for replay
    /// files and logging.
    #[serde(default)]
    pub id: i64,
}

/// Syscall exit on `cpu` at `ktime_ns` with the kernel-level return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysExit {
    pub cpu: u32,
    pub caller: PidTgid,
    pub ktime_ns: u64,
    pub id: i64,
    pub ret: i64,
}

/// Process creation: `child_tgid` was forked by `parent_tgid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFork {
    pub parent_tgid: u32,
    pub child_tgid: u32,
}

/// Termination of process `tgid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub tgid: u32,
}

/// Any event an [`crate::source::EventSource`] can produce.
///
/// Serialized as one JSON object per line in replay files, e.g.
/// `{"type":"sys_enter","cpu":0,"caller":8589934594,"ktime_ns":10}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SysEnter(SysEnter),
    SysExit(SysExit),
    ProcessFork(ProcessFork),
    ProcessExit(ProcessExit),
}

impl Event {
    /// Thread-group id the event is attributed to
    pub fn tgid(&self) -> u32 {
        match self {
            Event::SysEnter(e) => e.caller.tgid(),
            Event::SysExit(e) => e.caller.tgid(),
            Event::ProcessFork(e) => e.parent_tgid,
            Event::ProcessExit(e) => e.tgid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_tgid_packing() {
        let id = PidTgid::new(1234, 1240);
        assert_eq!(id.tgid(), 1234);
        assert_eq!(id.tid(), 1240);
        assert_eq!(id.raw(), (1234u64 << 32) | 1240);
        assert_eq!(PidTgid::from_raw(id.raw()), id);
    }

    #[test]
    fn test_pid_tgid_empty() {
        assert!(PidTgid::default().is_empty());
        assert!(!PidTgid::new(1, 1).is_empty());
    }

    #[test]
    fn test_pid_tgid_display() {
        assert_eq!(PidTgid::new(7, 9).to_string(), "7/9");
    }

    #[test]
    fn test_event_json_line() {
        let event = Event::SysExit(SysExit {
            cpu: 3,
            caller: PidTgid::new(2, 2),
            ktime_ns: 500,
            id: 39,
            ret: 2,
        });
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"type\":\"sys_exit\""));
        let parsed: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_sys_enter_id_defaults_to_zero() {
        let parsed: Event =
            serde_json::from_str(r#"{"type":"sys_enter","cpu":0,"caller":4294967297,"ktime_ns":1}"#)
                .unwrap();
        match parsed {
            Event::SysEnter(e) => {
                assert_eq!(e.id, 0);
                assert_eq!(e.caller, PidTgid::new(1, 1));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_tgid() {
        let fork = Event::ProcessFork(ProcessFork {
            parent_tgid: 10,
            child_tgid: 11,
        });
        assert_eq!(fork.tgid(), 10);
        let exit = Event::ProcessExit(ProcessExit { tgid: 11 });
        assert_eq!(exit.tgid(), 11);
    }
}
