//! Event sources feeding the engine
//!
//! A source turns some observation mechanism into the engine's [`Event`]
//! stream. Sources are opened and driven on a single thread (ptrace requires
//! every request to come from the attaching thread).

pub mod ptrace;
pub mod replay;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::engine::Event;

pub use replay::ReplaySource;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Command array is empty")]
    EmptyCommand,

    #[error("Command argument contains a NUL byte: {0:?}")]
    NulInArgument(String),

    #[error("{context}: {source}")]
    Sys {
        context: String,
        source: nix::errno::Errno,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}:{line}: invalid event: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("Live tracing is not supported on this platform ({0})")]
    Unsupported(&'static str),
}

impl SourceError {
    pub(crate) fn sys(context: impl Into<String>, source: nix::errno::Errno) -> Self {
        SourceError::Sys {
            context: context.into(),
            source,
        }
    }
}

/// Where events come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Spawn and trace a command
    Run(Vec<String>),
    /// Attach to every thread of a running process
    Attach(u32),
    /// Replay a JSON-lines event file, optionally scoped to one process
    Replay { path: PathBuf, target: Option<u32> },
}

/// A stream of engine events
pub trait EventSource {
    /// Thread-group id of the measured process, if the source has one
    fn root_tgid(&self) -> Option<u32>;

    /// Next event, or `None` once the source is exhausted or `stop` is set
    fn next_event(&mut self, stop: &AtomicBool) -> Result<Option<Event>, SourceError>;

    /// Release everything the source holds on to
    fn detach(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Exit status of the measured program, when the source spawned it
    fn exit_status(&self) -> Option<i32> {
        None
    }
}

impl SourceSpec {
    /// Open the source on the calling thread
    pub fn open(&self, follow: bool) -> Result<Box<dyn EventSource>, SourceError> {
        match self {
            SourceSpec::Run(command) => Ok(Box::new(ptrace::PtraceSource::spawn(command, follow)?)),
            SourceSpec::Attach(pid) => Ok(Box::new(ptrace::PtraceSource::attach(*pid, follow)?)),
            SourceSpec::Replay { path, target } => {
                Ok(Box::new(ReplaySource::open(path)?.with_target(*target)))
            }
        }
    }
}
