//! Replay of recorded events
//!
//! One JSON object per line, as produced by serializing [`Event`]. Blank
//! lines and lines starting with `#` are skipped. Replay is the way to feed
//! whole-system traces (recorded by a kernel-side collector) through the
//! engine, and it lets tests drive exact interleavings.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{EventSource, SourceError};
use crate::engine::Event;

pub struct ReplaySource<R> {
    reader: R,
    path: PathBuf,
    line: usize,
    target: Option<u32>,
    buf: String,
}

impl ReplaySource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(BufReader::new(file), path))
    }
}

impl<R: BufRead> ReplaySource<R> {
    /// `name` is only used in error messages
    pub fn from_reader(reader: R, name: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: name.into(),
            line: 0,
            target: None,
            buf: String::new(),
        }
    }

    /// Process the recording was scoped to, reported as the root
    pub fn with_target(mut self, target: Option<u32>) -> Self {
        self.target = target;
        self
    }
}

impl<R: BufRead> EventSource for ReplaySource<R> {
    fn root_tgid(&self) -> Option<u32> {
        self.target
    }

    fn next_event(&mut self, stop: &AtomicBool) -> Result<Option<Event>, SourceError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            self.buf.clear();
            let read = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|source| SourceError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;

            let line = self.buf.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event = serde_json::from_str(line).map_err(|source| SourceError::Parse {
                path: self.path.clone(),
                line: self.line,
                source,
            })?;
            return Ok(Some(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PidTgid, ProcessFork, SysEnter};
    use std::io::Cursor;

    const TRACE: &str = r#"# recorded on a 2-cpu box
{"type":"sys_enter","cpu":0,"caller":4294967297,"ktime_ns":100,"id":39}

{"type":"process_fork","parent_tgid":1,"child_tgid":2}
"#;

    #[test]
    fn test_reads_events_and_skips_comments() {
        let stop = AtomicBool::new(false);
        let mut source = ReplaySource::from_reader(Cursor::new(TRACE), "trace.jsonl");
        assert_eq!(
            source.next_event(&stop).unwrap(),
            Some(Event::SysEnter(SysEnter {
                cpu: 0,
                caller: PidTgid::new(1, 1),
                ktime_ns: 100,
                id: 39
            }))
        );
        assert_eq!(
            source.next_event(&stop).unwrap(),
            Some(Event::ProcessFork(ProcessFork {
                parent_tgid: 1,
                child_tgid: 2
            }))
        );
        assert_eq!(source.next_event(&stop).unwrap(), None);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let stop = AtomicBool::new(false);
        let mut source =
            ReplaySource::from_reader(Cursor::new("\n{\"type\":\"bogus\"}\n"), "bad.jsonl");
        let err = source.next_event(&stop).unwrap_err();
        assert!(matches!(err, SourceError::Parse { line: 2, .. }));
        assert!(err.to_string().starts_with("bad.jsonl:2:"));
    }

    #[test]
    fn test_stop_flag_ends_replay() {
        let stop = AtomicBool::new(true);
        let mut source = ReplaySource::from_reader(Cursor::new(TRACE), "trace.jsonl");
        assert_eq!(source.next_event(&stop).unwrap(), None);
    }

    #[test]
    fn test_root_is_target() {
        let source = ReplaySource::from_reader(Cursor::new(""), "empty").with_target(Some(7));
        assert_eq!(source.root_tgid(), Some(7));
    }

    #[test]
    fn test_missing_file() {
        let err = ReplaySource::open(Path::new("/nonexistent/trace.jsonl")).err();
        assert!(matches!(err, Some(SourceError::Io { .. })));
    }
}
