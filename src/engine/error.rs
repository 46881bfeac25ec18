use thiserror::Error;

/// Failures while attaching the engine. Fatal to the measurement session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Counter table cannot be sized for {num_syscalls} syscalls on {num_cpus} CPUs")]
    TableSize { num_cpus: usize, num_syscalls: usize },

    #[error("Tracked-process set needs a non-zero capacity")]
    TrackedCapacity,

    #[error("Following process trees requires a root process id")]
    FollowWithoutRoot,

    #[error("Root process {0} is the measuring process itself")]
    RootIsSelf(u32),

    #[error("Hook {hook} rejected: {reason}")]
    HookRejected { hook: &'static str, reason: String },
}
