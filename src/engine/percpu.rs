//! Processor-local replicas
//!
//! `PerCpu<T>` holds one `T` per logical processor. Writers only ever touch
//! the replica of the processor they run for; readers walk every replica and
//! merge. Replicas are cache-line padded so writers on neighbouring
//! processors never share a line.

use crossbeam::utils::CachePadded;

/// One value per logical processor, indexed by processor id
#[derive(Debug)]
pub struct PerCpu<T> {
    replicas: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    /// Build `num_cpus` replicas with `init`, which receives the processor id
    pub fn new_with(num_cpus: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let replicas = (0..num_cpus)
            .map(|cpu| CachePadded::new(init(cpu)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { replicas }
    }

    /// Replica owned by `cpu`, or `None` if the id is out of range
    #[inline]
    pub fn get(&self, cpu: u32) -> Option<&T> {
        self.replicas.get(cpu as usize).map(|r| &**r)
    }

    pub fn num_cpus(&self) -> usize {
        self.replicas.len()
    }

    /// Every replica in processor order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.replicas.iter().map(|r| &**r)
    }
}

impl<T: Default> PerCpu<T> {
    pub fn new(num_cpus: usize) -> Self {
        Self::new_with(num_cpus, |_| T::default())
    }
}
