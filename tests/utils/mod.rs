// Integration test utilities
//
// Event builders and an in-memory event source for driving the engine and
// the controller without a live tracee.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use scbench::engine::{Event, PidTgid, ProcessExit, ProcessFork, SysEnter, SysExit};
use scbench::source::{EventSource, SourceError};

pub const GETPID: i64 = 39;
pub const READ: i64 = 0;

pub fn enter(cpu: u32, tgid: u32, tid: u32, ktime_ns: u64, id: i64) -> Event {
    Event::SysEnter(SysEnter {
        cpu,
        caller: PidTgid::new(tgid, tid),
        ktime_ns,
        id,
    })
}

pub fn exit(cpu: u32, tgid: u32, tid: u32, ktime_ns: u64, id: i64, ret: i64) -> Event {
    Event::SysExit(SysExit {
        cpu,
        caller: PidTgid::new(tgid, tid),
        ktime_ns,
        id,
        ret,
    })
}

pub fn fork(parent_tgid: u32, child_tgid: u32) -> Event {
    Event::ProcessFork(ProcessFork {
        parent_tgid,
        child_tgid,
    })
}

pub fn process_exit(tgid: u32) -> Event {
    Event::ProcessExit(ProcessExit { tgid })
}

/// `n` back-to-back calls of `id` by `tgid` on `cpu`, each `latency_ns` long
pub fn calls(cpu: u32, tgid: u32, id: i64, n: usize, start_ns: u64, latency_ns: u64) -> Vec<Event> {
    (0..n as u64)
        .flat_map(|i| {
            let t = start_ns + i * (latency_ns + 10);
            [
                enter(cpu, tgid, tgid, t, id),
                exit(cpu, tgid, tgid, t + latency_ns, id, 0),
            ]
        })
        .collect()
}

/// Replays a fixed list of events
pub struct VecSource {
    events: VecDeque<Event>,
    root: Option<u32>,
    exit_status: Option<i32>,
}

impl VecSource {
    pub fn new(events: Vec<Event>, root: Option<u32>) -> Self {
        Self {
            events: events.into(),
            root,
            exit_status: None,
        }
    }

    pub fn with_exit_status(mut self, code: i32) -> Self {
        self.exit_status = Some(code);
        self
    }
}

impl EventSource for VecSource {
    fn root_tgid(&self) -> Option<u32> {
        self.root
    }

    fn next_event(&mut self, stop: &AtomicBool) -> Result<Option<Event>, SourceError> {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        Ok(self.events.pop_front())
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

/// Write events as a JSON-lines replay file
pub fn write_replay(path: &Path, events: &[Event]) {
    let mut file = std::fs::File::create(path).unwrap();
    for event in events {
        writeln!(file, "{}", serde_json::to_string(event).unwrap()).unwrap();
    }
}
