//! Scratch slot and counter table shared by the syscall hooks
//!
//! Both structures are per-processor arrays. A replica has exactly one
//! writer: the hook running for its processor. Fields are `AtomicU64` only so
//! the host controller can read them from another thread without a data
//! race; writers use plain relaxed loads and stores, never read-modify-write
//! instructions, so the hot path compiles to ordinary moves.
//!
//! Readers never write. Clearing between checkpoints is done by the reader
//! keeping the previous snapshot as a baseline.

use std::sync::atomic::{AtomicU64, Ordering};

use super::events::PidTgid;
use super::percpu::PerCpu;

/// Identity and start time of the call in flight on one processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InFlightCall {
    pub caller: PidTgid,
    pub start_ns: u64,
}

/// Processor-local scratch slot holding an [`InFlightCall`]
#[derive(Debug, Default)]
pub struct InFlightSlot {
    caller: AtomicU64,
    start_ns: AtomicU64,
}

impl InFlightSlot {
    /// Overwrite whatever the slot held
    #[inline]
    pub fn store(&self, call: InFlightCall) {
        self.caller.store(call.caller.raw(), Ordering::Relaxed);
        self.start_ns.store(call.start_ns, Ordering::Relaxed);
    }

    /// Current content, `None` if the slot is empty
    #[inline]
    pub fn load(&self) -> Option<InFlightCall> {
        let caller = PidTgid::from_raw(self.caller.load(Ordering::Relaxed));
        if caller.is_empty() {
            return None;
        }
        Some(InFlightCall {
            caller,
            start_ns: self.start_ns.load(Ordering::Relaxed),
        })
    }

    /// Zero the slot so a later exit cannot match a consumed entry
    #[inline]
    pub fn clear(&self) {
        self.store(InFlightCall::default());
    }
}

/// Count and cumulative latency of one syscall on one processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterValue {
    pub count: u64,
    /// Cumulative elapsed nanoseconds
    pub overhead: u64,
}

impl CounterValue {
    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.overhead == 0
    }
}

impl std::ops::Add for CounterValue {
    type Output = CounterValue;

    fn add(self, rhs: Self) -> Self {
        CounterValue {
            count: self.count.wrapping_add(rhs.count),
            overhead: self.overhead.wrapping_add(rhs.overhead),
        }
    }
}

impl std::ops::AddAssign for CounterValue {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for CounterValue {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(CounterValue::default(), |acc, v| acc + v)
    }
}

/// Processor-local counter for a single syscall number
#[derive(Debug, Default)]
pub struct SyscallCounter {
    count: AtomicU64,
    overhead: AtomicU64,
}

impl SyscallCounter {
    /// Credit one completed call that took `elapsed_ns`.
    ///
    /// Only the owning processor's exit hook calls this, so the load/store
    /// pairs cannot lose updates.
    #[inline]
    pub fn credit(&self, elapsed_ns: u64) {
        let count = self.count.load(Ordering::Relaxed);
        self.count.store(count.wrapping_add(1), Ordering::Relaxed);
        let overhead = self.overhead.load(Ordering::Relaxed);
        self.overhead
            .store(overhead.wrapping_add(elapsed_ns), Ordering::Relaxed);
    }

    pub fn read(&self) -> CounterValue {
        CounterValue {
            count: self.count.load(Ordering::Relaxed),
            overhead: self.overhead.load(Ordering::Relaxed),
        }
    }
}

/// `NUM_SYSCALLS` counters per processor
#[derive(Debug)]
pub struct CounterTable {
    replicas: PerCpu<Box<[SyscallCounter]>>,
    num_syscalls: usize,
}

impl CounterTable {
    pub fn new(num_cpus: usize, num_syscalls: usize) -> Self {
        let replicas = PerCpu::new_with(num_cpus, |_| {
            (0..num_syscalls)
                .map(|_| SyscallCounter::default())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        Self {
            replicas,
            num_syscalls,
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.replicas.num_cpus()
    }

    pub fn num_syscalls(&self) -> usize {
        self.num_syscalls
    }

    /// Counter for `sysno` on `cpu`; `None` for negative or out-of-range
    /// syscall numbers and unknown processors
    #[inline]
    pub fn lookup(&self, cpu: u32, sysno: i64) -> Option<&SyscallCounter> {
        let index = usize::try_from(sysno).ok()?;
        self.replicas.get(cpu)?.get(index)
    }

    /// Value of `sysno` on every processor, in processor order
    pub fn read_percpu(&self, sysno: usize) -> Vec<CounterValue> {
        self.replicas
            .iter()
            .map(|replica| replica.get(sysno).map(SyscallCounter::read).unwrap_or_default())
            .collect()
    }

    /// Copy of every replica
    pub fn snapshot(&self) -> CounterSnapshot {
        let percpu = self
            .replicas
            .iter()
            .map(|replica| replica.iter().map(SyscallCounter::read).collect())
            .collect();
        CounterSnapshot { percpu }
    }
}

/// Point-in-time copy of a [`CounterTable`], `percpu[cpu][sysno]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub percpu: Vec<Vec<CounterValue>>,
}

impl CounterSnapshot {
    /// Sum every processor's replica of `sysno`
    pub fn merged(&self, sysno: usize) -> CounterValue {
        self.percpu
            .iter()
            .filter_map(|replica| replica.get(sysno).copied())
            .sum()
    }

    /// Per-syscall totals across all processors
    pub fn merge(&self) -> Vec<CounterValue> {
        let width = self.percpu.iter().map(Vec::len).max().unwrap_or(0);
        (0..width).map(|sysno| self.merged(sysno)).collect()
    }
}
