//! Syscall accounting engine
//!
//! Four hooks share per-processor state:
//!
//! ```text
//! sys_enter ──► InFlightSlot[cpu] ──► sys_exit ──► CounterTable[cpu][sysno]
//!                                         ▲
//! process_fork / process_exit ──► TrackedSet (tree-following only)
//! ```
//!
//! Every hook is a pure function of its event and the engine state and
//! returns a [`Verdict`]. Discards never touch state and are never
//! escalated; a dropped measurement is always preferred over a corrupted
//! counter.
//!
//! Concurrency: each hook invocation carries the processor it runs for and
//! only writes that processor's replicas. Hooks for different processors may
//! run on different threads at the same time. The [`TrackedSet`] is the only
//! structure written across processors.

pub mod error;
pub mod events;
pub mod maps;
pub mod percpu;
pub mod tracked;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use error::AttachError;
pub use events::{Event, PidTgid, ProcessExit, ProcessFork, SysEnter, SysExit};
pub use maps::{CounterSnapshot, CounterTable, CounterValue, InFlightCall, InFlightSlot};
pub use percpu::PerCpu;
pub use tracked::{TrackedSet, DEFAULT_TRACKED_CAPACITY};

use crate::syscalls;

/// Constants fixed at attach time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Process to measure; `None` measures the whole system
    pub target_tgid: Option<u32>,
    /// The measuring process, always excluded
    pub self_tgid: u32,
    /// Follow descendants of `target_tgid`
    pub follow: bool,
    /// Size of the syscall-number space; sizes the counter table
    pub num_syscalls: usize,
    /// Number of processor replicas
    pub num_cpus: usize,
    /// Slots in the tracked-process set
    pub tracked_capacity: usize,
}

impl ProbeConfig {
    /// Whole-system configuration for the current platform
    pub fn new(self_tgid: u32, num_cpus: usize) -> Self {
        Self {
            target_tgid: None,
            self_tgid,
            follow: false,
            num_syscalls: syscalls::NUM_SYSCALLS,
            num_cpus,
            tracked_capacity: DEFAULT_TRACKED_CAPACITY,
        }
    }

    pub fn with_target(mut self, tgid: u32) -> Self {
        self.target_tgid = Some(tgid);
        self
    }

    pub fn following(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn with_num_syscalls(mut self, num_syscalls: usize) -> Self {
        self.num_syscalls = num_syscalls;
        self
    }

    pub fn with_tracked_capacity(mut self, capacity: usize) -> Self {
        self.tracked_capacity = capacity;
        self
    }
}

/// Kernel attach points the engine hooks into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    SysEnter,
    SysExit,
    ProcessFork,
    ProcessExit,
}

impl Hook {
    pub fn attach_point(self) -> &'static str {
        match self {
            Hook::SysEnter => "raw_syscalls:sys_enter",
            Hook::SysExit => "raw_syscalls:sys_exit",
            Hook::ProcessFork => "sched:sched_process_fork",
            Hook::ProcessExit => "sched:sched_process_exit",
        }
    }
}

/// Why an event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Discard {
    /// Caller outside the traced process or tree
    OutOfScope,
    /// Caller is the measuring process
    SelfProcess,
    /// `restart_syscall` pseudo-call
    RestartSyscall,
    /// Return value says the kernel will re-enter the call
    RestartPending,
    /// No counter record for this syscall number
    UnknownSyscall,
    /// Processor id outside the replica range
    UnknownCpu,
    /// No entry recorded in this processor's slot
    NoInFlightCall,
    /// Slot written by a different caller (double return or migration)
    CallerMismatch,
    /// Fork or exit of a process outside the tree
    NotTracked,
    /// No free slot for a new tree member
    TrackedSetFull,
    /// Event for a hook that is not installed
    HookNotAttached,
}

/// Coarse grouping of discards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardCategory {
    Policy,
    KernelRestart,
    MissingState,
    IdentityMismatch,
}

impl Discard {
    pub fn category(self) -> DiscardCategory {
        match self {
            Discard::OutOfScope
            | Discard::SelfProcess
            | Discard::NotTracked
            | Discard::HookNotAttached => DiscardCategory::Policy,
            Discard::RestartSyscall | Discard::RestartPending => DiscardCategory::KernelRestart,
            Discard::UnknownSyscall
            | Discard::UnknownCpu
            | Discard::NoInFlightCall
            | Discard::TrackedSetFull => DiscardCategory::MissingState,
            Discard::CallerMismatch => DiscardCategory::IdentityMismatch,
        }
    }

    /// Whether a measurement was lost. Membership events that the tree has
    /// no use for are ignored rather than dropped.
    pub fn loses_measurement(self) -> bool {
        !matches!(self, Discard::NotTracked | Discard::HookNotAttached)
    }
}

/// Outcome of one hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Entry written to the scratch slot
    Recorded,
    /// Exit credited to `sysno`
    Credited { sysno: usize, elapsed_ns: u64 },
    /// Process joined the tracked tree
    Tracked(u32),
    /// Process left the tracked tree
    Untracked(u32),
    Discarded(Discard),
}

impl Verdict {
    pub fn discard(self) -> Option<Discard> {
        match self {
            Verdict::Discarded(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Attached engine: hook bodies plus the state they share
#[derive(Debug)]
pub struct Engine {
    config: ProbeConfig,
    hooks: Vec<Hook>,
    in_flight: PerCpu<InFlightSlot>,
    counters: CounterTable,
    tracked: Option<TrackedSet>,
}

impl Engine {
    /// Size the maps, seed the tracked set and install the hooks
    pub fn attach(config: ProbeConfig) -> Result<Self, AttachError> {
        if config.num_cpus == 0 || config.num_syscalls == 0 {
            return Err(AttachError::TableSize {
                num_cpus: config.num_cpus,
                num_syscalls: config.num_syscalls,
            });
        }
        config
            .num_cpus
            .checked_mul(config.num_syscalls)
            .ok_or(AttachError::TableSize {
                num_cpus: config.num_cpus,
                num_syscalls: config.num_syscalls,
            })?;
        if config.target_tgid == Some(config.self_tgid) {
            return Err(AttachError::RootIsSelf(config.self_tgid));
        }

        let mut hooks = vec![Hook::SysEnter, Hook::SysExit];
        let tracked = if config.follow {
            let root = config.target_tgid.ok_or(AttachError::FollowWithoutRoot)?;
            if config.tracked_capacity == 0 {
                return Err(AttachError::TrackedCapacity);
            }
            let set = TrackedSet::with_capacity(config.tracked_capacity);
            set.insert(root).map_err(|_| AttachError::HookRejected {
                hook: Hook::ProcessFork.attach_point(),
                reason: format!("cannot seed tracked set with {}", root),
            })?;
            hooks.push(Hook::ProcessFork);
            hooks.push(Hook::ProcessExit);
            Some(set)
        } else {
            None
        };

        for hook in &hooks {
            debug!("Attached {}", hook.attach_point());
        }

        Ok(Self {
            in_flight: PerCpu::new(config.num_cpus),
            counters: CounterTable::new(config.num_cpus, config.num_syscalls),
            tracked,
            hooks,
            config,
        })
    }

    /// Remove all hooks and return the final counter contents
    pub fn detach(self) -> CounterSnapshot {
        for hook in &self.hooks {
            debug!("Detached {}", hook.attach_point());
        }
        self.counters.snapshot()
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn is_attached(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }

    pub fn counters(&self) -> &CounterTable {
        &self.counters
    }

    pub fn tracked(&self) -> Option<&TrackedSet> {
        self.tracked.as_ref()
    }

    /// Scratch slot of `cpu`
    pub fn in_flight(&self, cpu: u32) -> Option<InFlightCall> {
        self.in_flight.get(cpu)?.load()
    }

    /// Route an event to its hook
    pub fn dispatch(&self, event: &Event) -> Verdict {
        match event {
            Event::SysEnter(e) => self.sys_enter(e),
            Event::SysExit(e) => self.sys_exit(e),
            Event::ProcessFork(e) => self.process_fork(e),
            Event::ProcessExit(e) => self.process_exit(e),
        }
    }

    fn is_root_or_member(&self, tgid: u32) -> bool {
        self.config.target_tgid == Some(tgid)
            || self.tracked.as_ref().is_some_and(|set| set.contains(tgid))
    }

    /// Scope policy shared by entry and exit
    #[inline]
    fn check_scope(&self, tgid: u32) -> Result<(), Discard> {
        if self.config.follow {
            if !self.is_root_or_member(tgid) {
                return Err(Discard::OutOfScope);
            }
        } else if let Some(target) = self.config.target_tgid {
            if tgid != target {
                return Err(Discard::OutOfScope);
            }
        }
        if tgid == self.config.self_tgid {
            return Err(Discard::SelfProcess);
        }
        Ok(())
    }

    /// `raw_syscalls:sys_enter`
    pub fn sys_enter(&self, event: &SysEnter) -> Verdict {
        if let Err(reason) = self.check_scope(event.caller.tgid()) {
            return Verdict::Discarded(reason);
        }
        let Some(slot) = self.in_flight.get(event.cpu) else {
            return Verdict::Discarded(Discard::UnknownCpu);
        };
        slot.store(InFlightCall {
            caller: event.caller,
            start_ns: event.ktime_ns,
        });
        Verdict::Recorded
    }

    /// `raw_syscalls:sys_exit`
    pub fn sys_exit(&self, event: &SysExit) -> Verdict {
        if event.id == syscalls::RESTART_SYSCALL {
            return Verdict::Discarded(Discard::RestartSyscall);
        }
        if syscalls::is_restart_sentinel(event.ret) {
            return Verdict::Discarded(Discard::RestartPending);
        }
        if let Err(reason) = self.check_scope(event.caller.tgid()) {
            return Verdict::Discarded(reason);
        }

        let Some(slot) = self.in_flight.get(event.cpu) else {
            return Verdict::Discarded(Discard::UnknownCpu);
        };
        let Some(counter) = self.counters.lookup(event.cpu, event.id) else {
            return Verdict::Discarded(Discard::UnknownSyscall);
        };
        let Some(start) = slot.load() else {
            return Verdict::Discarded(Discard::NoInFlightCall);
        };
        if start.caller != event.caller {
            return Verdict::Discarded(Discard::CallerMismatch);
        }

        let elapsed_ns = event.ktime_ns.saturating_sub(start.start_ns);
        counter.credit(elapsed_ns);
        slot.clear();

        Verdict::Credited {
            // lookup() succeeded, so id is a valid non-negative index
            sysno: event.id as usize,
            elapsed_ns,
        }
    }

    /// `sched:sched_process_fork`
    pub fn process_fork(&self, event: &ProcessFork) -> Verdict {
        let Some(set) = self.tracked.as_ref() else {
            return Verdict::Discarded(Discard::HookNotAttached);
        };
        if !self.is_root_or_member(event.parent_tgid) {
            return Verdict::Discarded(Discard::NotTracked);
        }
        match set.insert(event.child_tgid) {
            Ok(_) => {
                debug!(
                    "Tracking new process {} (parent {})",
                    event.child_tgid, event.parent_tgid
                );
                Verdict::Tracked(event.child_tgid)
            }
            Err(_) => {
                warn!(
                    "Tracked-process set full, not following {} (parent {})",
                    event.child_tgid, event.parent_tgid
                );
                Verdict::Discarded(Discard::TrackedSetFull)
            }
        }
    }

    /// `sched:sched_process_exit`
    pub fn process_exit(&self, event: &ProcessExit) -> Verdict {
        let Some(set) = self.tracked.as_ref() else {
            return Verdict::Discarded(Discard::HookNotAttached);
        };
        if !self.is_root_or_member(event.tgid) {
            return Verdict::Discarded(Discard::NotTracked);
        }
        set.remove(event.tgid);
        debug!("No longer tracking dead process {}", event.tgid);
        Verdict::Untracked(event.tgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF: u32 = 999;
    const GETPID: i64 = 39;

    fn enter(cpu: u32, tgid: u32, tid: u32, ktime_ns: u64) -> SysEnter {
        SysEnter {
            cpu,
            caller: PidTgid::new(tgid, tid),
            ktime_ns,
            id: 0,
        }
    }

    fn exit(cpu: u32, tgid: u32, tid: u32, ktime_ns: u64, id: i64, ret: i64) -> SysExit {
        SysExit {
            cpu,
            caller: PidTgid::new(tgid, tid),
            ktime_ns,
            id,
            ret,
        }
    }

    fn system_wide() -> Engine {
        Engine::attach(ProbeConfig::new(SELF, 2)).unwrap()
    }

    #[test]
    fn test_attach_installs_syscall_hooks() {
        let engine = system_wide();
        assert_eq!(engine.hooks(), &[Hook::SysEnter, Hook::SysExit]);
        assert!(engine.tracked().is_none());
    }

    #[test]
    fn test_attach_follow_installs_tree_hooks() {
        let engine =
            Engine::attach(ProbeConfig::new(SELF, 1).with_target(10).following(true)).unwrap();
        assert!(engine.is_attached(Hook::ProcessFork));
        assert!(engine.is_attached(Hook::ProcessExit));
        assert!(engine.tracked().unwrap().contains(10));
    }

    #[test]
    fn test_attach_rejects_bad_config() {
        assert_eq!(
            Engine::attach(ProbeConfig::new(SELF, 0)).unwrap_err(),
            AttachError::TableSize {
                num_cpus: 0,
                num_syscalls: syscalls::NUM_SYSCALLS
            }
        );
        assert_eq!(
            Engine::attach(ProbeConfig::new(SELF, 1).with_num_syscalls(0)).unwrap_err(),
            AttachError::TableSize {
                num_cpus: 1,
                num_syscalls: 0
            }
        );
        assert_eq!(
            Engine::attach(ProbeConfig::new(SELF, 1).following(true)).unwrap_err(),
            AttachError::FollowWithoutRoot
        );
        assert_eq!(
            Engine::attach(
                ProbeConfig::new(SELF, 1)
                    .with_target(1)
                    .following(true)
                    .with_tracked_capacity(0)
            )
            .unwrap_err(),
            AttachError::TrackedCapacity
        );
        assert_eq!(
            Engine::attach(ProbeConfig::new(SELF, 1).with_target(SELF)).unwrap_err(),
            AttachError::RootIsSelf(SELF)
        );
    }

    #[test]
    fn test_enter_exit_credits_once() {
        let engine = system_wide();
        assert_eq!(engine.sys_enter(&enter(0, 5, 5, 100)), Verdict::Recorded);
        assert_eq!(
            engine.sys_exit(&exit(0, 5, 5, 350, GETPID, 5)),
            Verdict::Credited {
                sysno: GETPID as usize,
                elapsed_ns: 250
            }
        );
        // The slot was cleared, a second return is not credited
        assert_eq!(
            engine.sys_exit(&exit(0, 5, 5, 400, GETPID, 5)),
            Verdict::Discarded(Discard::NoInFlightCall)
        );
        let value = engine.counters().snapshot().merged(GETPID as usize);
        assert_eq!(
            value,
            CounterValue {
                count: 1,
                overhead: 250
            }
        );
    }

    #[test]
    fn test_restart_syscall_never_counted() {
        let engine = system_wide();
        engine.sys_enter(&enter(0, 5, 5, 0));
        assert_eq!(
            engine.sys_exit(&exit(0, 5, 5, 10, syscalls::RESTART_SYSCALL, 0)),
            Verdict::Discarded(Discard::RestartSyscall)
        );
        let snapshot = engine.counters().snapshot();
        assert!(snapshot
            .merged(syscalls::RESTART_SYSCALL as usize)
            .is_zero());
    }

    #[test]
    fn test_restart_sentinel_then_completion() {
        let engine = system_wide();
        let read = 0;
        engine.sys_enter(&enter(1, 5, 6, 0));
        assert_eq!(
            engine.sys_exit(&exit(1, 5, 6, 10, read, -syscalls::ERESTARTSYS)),
            Verdict::Discarded(Discard::RestartPending)
        );
        // The kernel re-enters the call after the signal handler
        engine.sys_enter(&enter(1, 5, 6, 20));
        assert!(matches!(
            engine.sys_exit(&exit(1, 5, 6, 50, read, 4)),
            Verdict::Credited { elapsed_ns: 30, .. }
        ));
        let value = engine.counters().snapshot().merged(read as usize);
        assert_eq!(value.count, 1);
        assert_eq!(value.overhead, 30);
    }

    #[test]
    fn test_migration_is_dropped() {
        let engine = system_wide();
        engine.sys_enter(&enter(0, 5, 5, 0));
        assert_eq!(
            engine.sys_exit(&exit(1, 5, 5, 10, GETPID, 0)),
            Verdict::Discarded(Discard::NoInFlightCall)
        );
        // An unrelated caller wrote cpu 1's slot before the exit
        engine.sys_enter(&enter(1, 7, 7, 20));
        assert_eq!(
            engine.sys_exit(&exit(1, 5, 5, 30, GETPID, 0)),
            Verdict::Discarded(Discard::CallerMismatch)
        );
        assert!(engine.counters().snapshot().merge().iter().all(|v| v.is_zero()));
    }

    #[test]
    fn test_self_is_excluded() {
        let engine = system_wide();
        assert_eq!(
            engine.sys_enter(&enter(0, SELF, SELF, 0)),
            Verdict::Discarded(Discard::SelfProcess)
        );
        assert_eq!(
            engine.sys_exit(&exit(0, SELF, SELF, 5, GETPID, 0)),
            Verdict::Discarded(Discard::SelfProcess)
        );
        assert_eq!(engine.in_flight(0), None);
    }

    #[test]
    fn test_target_filter_without_follow() {
        let engine = Engine::attach(ProbeConfig::new(SELF, 1).with_target(42)).unwrap();
        assert_eq!(
            engine.sys_enter(&enter(0, 43, 43, 0)),
            Verdict::Discarded(Discard::OutOfScope)
        );
        assert_eq!(engine.sys_enter(&enter(0, 42, 44, 0)), Verdict::Recorded);
        assert_eq!(
            engine.process_fork(&ProcessFork {
                parent_tgid: 42,
                child_tgid: 50
            }),
            Verdict::Discarded(Discard::HookNotAttached)
        );
    }

    #[test]
    fn test_unknown_syscall_and_cpu() {
        let engine = Engine::attach(ProbeConfig::new(SELF, 1).with_num_syscalls(8)).unwrap();
        assert_eq!(
            engine.sys_enter(&enter(3, 5, 5, 0)),
            Verdict::Discarded(Discard::UnknownCpu)
        );
        engine.sys_enter(&enter(0, 5, 5, 0));
        assert_eq!(
            engine.sys_exit(&exit(0, 5, 5, 1, 8, 0)),
            Verdict::Discarded(Discard::UnknownSyscall)
        );
        assert_eq!(
            engine.sys_exit(&exit(0, 5, 5, 1, -1, 0)),
            Verdict::Discarded(Discard::UnknownSyscall)
        );
        // The slot survives a discard on an unknown number
        assert!(engine.in_flight(0).is_some());
    }

    #[test]
    fn test_tree_membership() {
        let engine =
            Engine::attach(ProbeConfig::new(SELF, 1).with_target(100).following(true)).unwrap();
        assert_eq!(
            engine.process_fork(&ProcessFork {
                parent_tgid: 100,
                child_tgid: 101
            }),
            Verdict::Tracked(101)
        );
        assert_eq!(
            engine.process_fork(&ProcessFork {
                parent_tgid: 300,
                child_tgid: 301
            }),
            Verdict::Discarded(Discard::NotTracked)
        );
        assert_eq!(
            engine.process_exit(&ProcessExit { tgid: 301 }),
            Verdict::Discarded(Discard::NotTracked)
        );
        assert_eq!(
            engine.process_exit(&ProcessExit { tgid: 101 }),
            Verdict::Untracked(101)
        );
        assert!(!engine.tracked().unwrap().contains(101));
    }

    #[test]
    fn test_discard_categories() {
        assert_eq!(Discard::SelfProcess.category(), DiscardCategory::Policy);
        assert_eq!(
            Discard::RestartPending.category(),
            DiscardCategory::KernelRestart
        );
        assert_eq!(
            Discard::NoInFlightCall.category(),
            DiscardCategory::MissingState
        );
        assert_eq!(
            Discard::CallerMismatch.category(),
            DiscardCategory::IdentityMismatch
        );
    }

    #[test]
    fn test_ignored_membership_events_lose_nothing() {
        assert!(!Discard::HookNotAttached.loses_measurement());
        assert!(!Discard::NotTracked.loses_measurement());
        assert!(Discard::TrackedSetFull.loses_measurement());
        assert!(Discard::OutOfScope.loses_measurement());
        assert!(Discard::CallerMismatch.loses_measurement());
    }

    #[test]
    fn test_detach_returns_final_counts() {
        let engine = system_wide();
        engine.sys_enter(&enter(0, 5, 5, 0));
        engine.sys_exit(&exit(0, 5, 5, 9, GETPID, 0));
        let snapshot = engine.detach();
        assert_eq!(snapshot.merged(GETPID as usize).count, 1);
    }
}
