//! Live event source built on ptrace
//!
//! Every syscall-stop of every tracee becomes a `SysEnter` or `SysExit`
//! event stamped with `CLOCK_MONOTONIC` and the processor the thread last
//! ran on (`/proc/<tid>/stat`). New processes become `ProcessFork` events,
//! reaped thread-group leaders `ProcessExit` events.
//!
//! ptrace only sees its own tracees, so this source always has a root
//! process; whole-system measurement goes through a replay file.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{EventSource, SourceError};
use crate::engine::Event;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use imp::PtraceSource;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub use unsupported::PtraceSource;

/// Per-thread bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tracee {
    tgid: u32,
    /// Between an entry stop and its exit stop
    in_syscall: bool,
    /// The initial SIGSTOP of an auto-attached child is still pending
    awaiting_start: bool,
    /// Process outside the measured tree, released at its first stop
    detach_pending: bool,
}

/// Thread-group id of `tid` from `/proc/<tid>/status`
fn read_tgid(tid: u32) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
    parse_status_field(&status, "Tgid:")
}

fn read_ppid(tid: u32) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
    parse_status_field(&status, "PPid:")
}

fn parse_status_field(status: &str, key: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|value| value.trim().parse().ok())
}

/// Queue of events not yet handed out plus the tracee table; shared by the
/// platform implementation.
#[derive(Debug, Default)]
struct TraceeTable {
    tracees: HashMap<u32, Tracee>,
    pending: VecDeque<Event>,
}

impl TraceeTable {
    fn pop(&mut self, stop: &AtomicBool) -> Option<Option<Event>> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Some(event));
        }
        if self.tracees.is_empty() || stop.load(Ordering::Relaxed) {
            return Some(None);
        }
        None
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use super::*;

    use std::ffi::CString;

    use nix::errno::Errno;
    use nix::sys::ptrace::{self, Options};
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::time::{clock_gettime, ClockId};
    use nix::unistd::{execvp, fork, write, ForkResult, Pid};
    use tracing::{debug, info, trace, warn};

    use crate::cpu;
    use crate::engine::{PidTgid, ProcessExit, ProcessFork, SysEnter, SysExit};

    const ENTRY_RAX: i64 = -(libc::ENOSYS as i64);

    pub struct PtraceSource {
        root: u32,
        follow: bool,
        spawned: bool,
        table: TraceeTable,
        exit_status: Option<i32>,
    }

    fn pid(tid: u32) -> Pid {
        Pid::from_raw(tid as i32)
    }

    fn ktime_ns() -> u64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64),
            Err(_) => 0,
        }
    }

    fn trace_options(follow: bool, spawned: bool) -> Options {
        // TRACECLONE picks up the threads of the measured process
        let mut options = Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEEXEC;
        if follow {
            options |= Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK;
        }
        if spawned {
            options |= Options::PTRACE_O_EXITKILL;
        }
        options
    }

    impl PtraceSource {
        /// Fork, exec `command` under PTRACE_TRACEME and trace it
        pub fn spawn(command: &[String], follow: bool) -> Result<Self, SourceError> {
            if command.is_empty() {
                return Err(SourceError::EmptyCommand);
            }
            // The child may only make async-signal-safe calls, so everything
            // it needs is allocated before the fork
            let argv = command
                .iter()
                .map(|arg| {
                    CString::new(arg.as_bytes())
                        .map_err(|_| SourceError::NulInArgument(arg.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let exec_failed = format!("Failed to exec {}: ", command[0]);

            // Fork: parent will trace, child will exec
            match unsafe { fork() }.map_err(|e| SourceError::sys("Failed to fork", e))? {
                ForkResult::Parent { child } => {
                    let root = child.as_raw() as u32;
                    // Stops with SIGTRAP once exec succeeded
                    let status = waitpid(child, None)
                        .map_err(|e| SourceError::sys("Failed to wait for child", e))?;
                    let exited = match status {
                        WaitStatus::Exited(_, code) => Some(code),
                        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
                        _ => None,
                    };
                    if let Some(code) = exited {
                        warn!("{:?} exited with {} before it could be traced", command, code);
                        return Ok(Self {
                            root,
                            follow,
                            spawned: true,
                            table: TraceeTable::default(),
                            exit_status: Some(code),
                        });
                    }
                    ptrace::setoptions(child, trace_options(follow, true))
                        .map_err(|e| SourceError::sys("Failed to set ptrace options", e))?;
                    ptrace::syscall(child, None)
                        .map_err(|e| SourceError::sys("Failed to PTRACE_SYSCALL", e))?;
                    info!("Running {:?} as process {}", command, root);

                    let mut table = TraceeTable::default();
                    table.tracees.insert(
                        root,
                        Tracee {
                            tgid: root,
                            in_syscall: false,
                            awaiting_start: false,
                            detach_pending: false,
                        },
                    );
                    Ok(Self {
                        root,
                        follow,
                        spawned: true,
                        table,
                        exit_status: None,
                    })
                }
                ForkResult::Child => {
                    let stderr = std::io::stderr();
                    if let Err(e) = ptrace::traceme() {
                        let _ = write(&stderr, b"Failed to PTRACE_TRACEME: ");
                        let _ = write(&stderr, e.desc().as_bytes());
                        let _ = write(&stderr, b"\n");
                        // SAFETY: _exit is async-signal-safe
                        unsafe { libc::_exit(1) };
                    }
                    // execvp only returns on failure
                    if let Err(e) = execvp(&argv[0], &argv) {
                        let _ = write(&stderr, exec_failed.as_bytes());
                        let _ = write(&stderr, e.desc().as_bytes());
                        let _ = write(&stderr, b"\n");
                    }
                    // SAFETY: _exit is async-signal-safe
                    unsafe { libc::_exit(127) }
                }
            }
        }

        /// PTRACE_ATTACH to every thread of `tgid`
        pub fn attach(tgid: u32, follow: bool) -> Result<Self, SourceError> {
            let task_dir = format!("/proc/{}/task", tgid);
            let tasks = std::fs::read_dir(&task_dir).map_err(|source| SourceError::Io {
                path: task_dir.clone().into(),
                source,
            })?;

            let mut table = TraceeTable::default();
            for entry in tasks.flatten() {
                let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
                else {
                    continue;
                };
                match Self::attach_thread(tid, follow) {
                    Ok(()) => {
                        table.tracees.insert(
                            tid,
                            Tracee {
                                tgid,
                                in_syscall: false,
                                awaiting_start: false,
                                detach_pending: false,
                            },
                        );
                    }
                    // The thread exited between readdir and attach
                    Err(SourceError::Sys {
                        source: Errno::ESRCH,
                        ..
                    }) if tid != tgid => continue,
                    Err(e) => return Err(e),
                }
            }
            info!(
                "Attached to process {} ({} threads)",
                tgid,
                table.tracees.len()
            );
            Ok(Self {
                root: tgid,
                follow,
                spawned: false,
                table,
                exit_status: None,
            })
        }

        fn attach_thread(tid: u32, follow: bool) -> Result<(), SourceError> {
            let p = pid(tid);
            ptrace::attach(p)
                .map_err(|e| SourceError::sys(format!("Failed to attach to PID {}", tid), e))?;
            // Wait for SIGSTOP from PTRACE_ATTACH
            waitpid(p, Some(WaitPidFlag::__WALL))
                .map_err(|e| SourceError::sys("Failed to wait for attach signal", e))?;
            ptrace::setoptions(p, trace_options(follow, false))
                .map_err(|e| SourceError::sys("Failed to set ptrace options", e))?;
            ptrace::syscall(p, None)
                .map_err(|e| SourceError::sys("Failed to PTRACE_SYSCALL", e))?;
            debug!("Attached to thread {}", tid);
            Ok(())
        }

        /// Resume `tid`; a tracee that vanished will be reaped later
        fn resume(tid: u32, signal: Option<Signal>) -> Result<(), SourceError> {
            match ptrace::syscall(pid(tid), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(SourceError::sys(format!("Failed to resume {}", tid), e)),
            }
        }

        /// Register a thread created by a traced parent, announcing it as a
        /// new process when its thread-group id differs from the parent's
        fn adopt(&mut self, child: u32, parent_tgid: Option<u32>, started: bool) {
            if self.table.tracees.contains_key(&child) {
                return;
            }
            let child_tgid = read_tgid(child).unwrap_or(child);
            let parent_tgid = parent_tgid.or_else(|| read_ppid(child));
            // Only a thread-group leader can be a new process
            let new_process = child_tgid == child && parent_tgid != Some(child_tgid);
            if new_process {
                if let Some(parent_tgid) = parent_tgid {
                    self.table.pending.push_back(Event::ProcessFork(ProcessFork {
                        parent_tgid,
                        child_tgid,
                    }));
                }
            }
            trace!("Adopted {} (tgid {})", child, child_tgid);
            self.table.tracees.insert(
                child,
                Tracee {
                    tgid: child_tgid,
                    in_syscall: false,
                    awaiting_start: !started,
                    detach_pending: new_process && !self.follow,
                },
            );
        }

        fn handle(&mut self, status: WaitStatus) -> Result<(), SourceError> {
            match status {
                WaitStatus::PtraceSyscall(p) => self.on_syscall_stop(p.as_raw() as u32),
                WaitStatus::PtraceEvent(p, _, event) => {
                    let tid = p.as_raw() as u32;
                    let is_new_task = event == ptrace::Event::PTRACE_EVENT_FORK as i32
                        || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
                        || event == ptrace::Event::PTRACE_EVENT_CLONE as i32;
                    if is_new_task {
                        if let Ok(child) = ptrace::getevent(p) {
                            let parent_tgid = self.table.tracees.get(&tid).map(|t| t.tgid);
                            self.adopt(child as u32, parent_tgid, false);
                        }
                    }
                    Self::resume(tid, None)
                }
                WaitStatus::Stopped(p, signal) => self.on_signal_stop(p.as_raw() as u32, signal),
                WaitStatus::Exited(p, code) => {
                    self.on_exit(p.as_raw() as u32, code);
                    Ok(())
                }
                WaitStatus::Signaled(p, signal, _) => {
                    self.on_exit(p.as_raw() as u32, 128 + signal as i32);
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn on_syscall_stop(&mut self, tid: u32) -> Result<(), SourceError> {
            let ktime_ns = ktime_ns();
            let Some(tracee) = self.table.tracees.get_mut(&tid) else {
                return Self::resume(tid, None);
            };
            let caller = PidTgid::new(tracee.tgid, tid);

            // An unknown processor id makes the engine drop the call
            let cpu = cpu::last_cpu_of(tid).unwrap_or(u32::MAX);
            match ptrace::getregs(pid(tid)) {
                Ok(regs) => {
                    let id = regs.orig_rax as i64;
                    // rax holds -ENOSYS at every entry stop; anything else
                    // means we attached in the middle of a call
                    let entering = !tracee.in_syscall && regs.rax as i64 == ENTRY_RAX;
                    tracee.in_syscall = entering;
                    let event = if entering {
                        Event::SysEnter(SysEnter {
                            cpu,
                            caller,
                            ktime_ns,
                            id,
                        })
                    } else {
                        Event::SysExit(SysExit {
                            cpu,
                            caller,
                            ktime_ns,
                            id,
                            ret: regs.rax as i64,
                        })
                    };
                    self.table.pending.push_back(event);
                }
                Err(Errno::ESRCH) => {}
                Err(e) => return Err(SourceError::sys("Failed to get registers", e)),
            }
            Self::resume(tid, None)
        }

        fn on_signal_stop(&mut self, tid: u32, signal: Signal) -> Result<(), SourceError> {
            match self.table.tracees.get_mut(&tid) {
                None => {
                    // Child's initial stop arrived before the parent's event
                    self.adopt(tid, None, true);
                    if signal == Signal::SIGSTOP {
                        return self.release_or_resume(tid, None);
                    }
                }
                Some(tracee) if tracee.awaiting_start && signal == Signal::SIGSTOP => {
                    tracee.awaiting_start = false;
                    return self.release_or_resume(tid, None);
                }
                Some(_) => {}
            }
            // Re-inject everything else
            self.release_or_resume(tid, Some(signal))
        }

        fn release_or_resume(
            &mut self,
            tid: u32,
            signal: Option<Signal>,
        ) -> Result<(), SourceError> {
            let detach = self
                .table
                .tracees
                .get(&tid)
                .is_some_and(|t| t.detach_pending);
            if detach {
                self.table.tracees.remove(&tid);
                debug!("Releasing {}, outside the measured tree", tid);
                return match ptrace::detach(pid(tid), signal) {
                    Ok(()) | Err(Errno::ESRCH) => Ok(()),
                    Err(e) => Err(SourceError::sys(format!("Failed to detach {}", tid), e)),
                };
            }
            Self::resume(tid, signal)
        }

        fn on_exit(&mut self, tid: u32, code: i32) {
            let Some(tracee) = self.table.tracees.remove(&tid) else {
                return;
            };
            if tid == tracee.tgid {
                self.table
                    .pending
                    .push_back(Event::ProcessExit(ProcessExit { tgid: tracee.tgid }));
            }
            if tid == self.root {
                debug!("Root process {} exited with {}", tid, code);
                if self.spawned {
                    self.exit_status = Some(code);
                }
            }
        }

        /// Stop a running thread so it can be detached
        fn interrupt(&self, tid: u32, tgid: u32) {
            // tgkill so only this thread receives the SIGSTOP
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    tgid as libc::pid_t,
                    tid as libc::pid_t,
                    libc::SIGSTOP,
                )
            };
            if ret != 0 {
                trace!("tgkill({}, {}) failed", tgid, tid);
            }
        }
    }

    impl EventSource for PtraceSource {
        fn root_tgid(&self) -> Option<u32> {
            Some(self.root)
        }

        fn next_event(&mut self, stop: &AtomicBool) -> Result<Option<Event>, SourceError> {
            loop {
                if let Some(next) = self.table.pop(stop) {
                    return Ok(next);
                }
                // Blocks so the stop is stamped as soon as it happens; the
                // controller interrupts the wait with a signal to stop
                match waitpid(None, Some(WaitPidFlag::__WALL)) {
                    Ok(status) => self.handle(status)?,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        self.table.tracees.clear();
                    }
                    Err(e) => return Err(SourceError::sys("Failed to waitpid", e)),
                }
            }
        }

        fn detach(&mut self) -> Result<(), SourceError> {
            if self.table.tracees.is_empty() {
                return Ok(());
            }
            if self.spawned {
                // EXITKILL would do the same once we exit; be explicit
                info!("Stopping measured program {}", self.root);
                if let Err(e) = kill(pid(self.root), Signal::SIGKILL) {
                    warn!("Failed to kill {}: {}", self.root, e);
                }
                loop {
                    match waitpid(None, Some(WaitPidFlag::__WALL)) {
                        Ok(status) => {
                            if let Some(p) = status.pid() {
                                self.on_exit(p.as_raw() as u32, 128 + Signal::SIGKILL as i32);
                            }
                        }
                        Err(Errno::EINTR) => continue,
                        Err(_) => break,
                    }
                }
                self.table.tracees.clear();
                return Ok(());
            }

            let tracees: Vec<(u32, Tracee)> =
                self.table.tracees.iter().map(|(&tid, &t)| (tid, t)).collect();
            for (tid, tracee) in &tracees {
                self.interrupt(*tid, tracee.tgid);
            }
            for (tid, _) in &tracees {
                match waitpid(pid(*tid), Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to wait for {} before detaching: {}", tid, e);
                        continue;
                    }
                }
                if let Err(e) = ptrace::detach(pid(*tid), None) {
                    warn!("Failed to detach from {}: {}", tid, e);
                }
            }
            // Undo the SIGSTOPs that were queued rather than consumed
            let mut groups: Vec<u32> = tracees.iter().map(|(_, t)| t.tgid).collect();
            groups.sort_unstable();
            groups.dedup();
            for tgid in groups {
                if let Err(e) = kill(pid(tgid), Signal::SIGCONT) {
                    trace!("Failed to continue {}: {}", tgid, e);
                }
            }
            info!("Detached from process {}", self.root);
            self.table.tracees.clear();
            Ok(())
        }

        fn exit_status(&self) -> Option<i32> {
            self.exit_status
        }
    }

}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod unsupported {
    use super::*;

    /// Placeholder on platforms without x86_64 ptrace register access
    pub struct PtraceSource {
        _table: TraceeTable,
    }

    impl PtraceSource {
        pub fn spawn(_command: &[String], _follow: bool) -> Result<Self, SourceError> {
            Err(SourceError::Unsupported(std::env::consts::ARCH))
        }

        pub fn attach(_tgid: u32, _follow: bool) -> Result<Self, SourceError> {
            Err(SourceError::Unsupported(std::env::consts::ARCH))
        }
    }

    impl EventSource for PtraceSource {
        fn root_tgid(&self) -> Option<u32> {
            None
        }

        fn next_event(&mut self, _stop: &AtomicBool) -> Result<Option<Event>, SourceError> {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_field() {
        let status = "Name:\tcat\nUmask:\t0022\nState:\tR (running)\nTgid:\t4242\nNgid:\t0\nPid:\t4243\nPPid:\t17\n";
        assert_eq!(parse_status_field(status, "Tgid:"), Some(4242));
        assert_eq!(parse_status_field(status, "PPid:"), Some(17));
        assert_eq!(parse_status_field(status, "Missing:"), None);
    }

    #[test]
    fn test_read_tgid_of_self() {
        let me = std::process::id();
        assert_eq!(read_tgid(me), Some(me));
    }

    #[test]
    fn test_table_pop_order() {
        let stop = AtomicBool::new(false);
        let mut table = TraceeTable::default();
        // No tracees and nothing queued: exhausted
        assert_eq!(table.pop(&stop), Some(None));

        table.pending.push_back(Event::ProcessExit(crate::engine::ProcessExit { tgid: 3 }));
        assert_eq!(
            table.pop(&stop),
            Some(Some(Event::ProcessExit(crate::engine::ProcessExit { tgid: 3 })))
        );

        table.tracees.insert(
            3,
            Tracee {
                tgid: 3,
                in_syscall: false,
                awaiting_start: false,
                detach_pending: false,
            },
        );
        // Tracees alive, nothing queued: caller must wait
        assert_eq!(table.pop(&stop), None);
        stop.store(true, Ordering::Relaxed);
        assert_eq!(table.pop(&stop), Some(None));
    }
}
