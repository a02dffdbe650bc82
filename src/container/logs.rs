//! Container log capture
//!
//! Log files are JSON lines `{"stream","time","log"}`, append-only with a
//! single writer (the supervisor). Exceeding the configured size rotates
//! the file once (`.1` suffix). Live followers (attach streams, log-follow
//! clients) receive each record as it lands.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tokio::sync::broadcast;

use crate::backend::StdStream;
use crate::error::Result;

/// One log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub stream: StdStream,
    pub time: DateTime<Utc>,
    pub log: String,
}

struct WriterState {
    file: std::fs::File,
    written: u64,
    /// Partial line carried between chunks, per stream
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,
}

/// Records buffered per lagging follower before it starts losing lines
const FOLLOWER_BUFFER: usize = 1024;

/// Live fan-out of log records to followers.
///
/// Followers that fall behind lose records (lagged) rather than stalling
/// the container's output path.
pub struct LogFollowers {
    sender: broadcast::Sender<LogRecord>,
}

impl LogFollowers {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(FOLLOWER_BUFFER);
        Self { sender }
    }

    /// Receive every record published after this call
    pub fn follow(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }

    /// Publish a record; dropped silently when nobody follows
    fn publish(&self, record: &LogRecord) {
        let _ = self.sender.send(record.clone());
    }

    /// Number of attached followers
    pub fn follower_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Single-writer JSON-lines log file with live fan-out
pub struct LogWriter {
    path: PathBuf,
    rotate_bytes: u64,
    state: Mutex<WriterState>,
    followers: LogFollowers,
}

impl LogWriter {
    pub fn open(path: &Path, rotate_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            rotate_bytes,
            state: Mutex::new(WriterState {
                file,
                written,
                stdout_partial: Vec::new(),
                stderr_partial: Vec::new(),
            }),
            followers: LogFollowers::new(),
        })
    }

    /// Live followers of this container's output
    pub fn followers(&self) -> &LogFollowers {
        &self.followers
    }

    /// Append a raw output chunk; complete lines become records, the
    /// remainder is buffered until the next chunk or flush.
    pub fn write(&self, stream: StdStream, chunk: &[u8]) {
        let mut state = self.state.lock();

        let partial = match stream {
            StdStream::Stdout => &mut state.stdout_partial,
            StdStream::Stderr => &mut state.stderr_partial,
        };
        partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = partial.drain(..=pos).collect();
            lines.push(line);
        }

        for line in lines {
            let record = LogRecord {
                stream,
                time: Utc::now(),
                log: String::from_utf8_lossy(&line).into_owned(),
            };
            self.append_record(&mut state, &record);
        }
    }

    /// Flush trailing partial lines (no newline before exit)
    pub fn flush(&self) {
        let mut state = self.state.lock();

        for stream in [StdStream::Stdout, StdStream::Stderr] {
            let partial = match stream {
                StdStream::Stdout => std::mem::take(&mut state.stdout_partial),
                StdStream::Stderr => std::mem::take(&mut state.stderr_partial),
            };
            if !partial.is_empty() {
                let record = LogRecord {
                    stream,
                    time: Utc::now(),
                    log: String::from_utf8_lossy(&partial).into_owned(),
                };
                self.append_record(&mut state, &record);
            }
        }
        let _ = state.file.flush();
    }

    fn append_record(&self, state: &mut WriterState, record: &LogRecord) {
        let Ok(mut line) = serde_json::to_vec(record) else {
            return;
        };
        line.push(b'\n');

        if state.written + line.len() as u64 > self.rotate_bytes {
            self.rotate(state);
        }

        if state.file.write_all(&line).is_ok() {
            state.written += line.len() as u64;
        }
        self.followers.publish(record);
    }

    /// One-deep rotation: current file becomes `.1`, a fresh file takes over
    fn rotate(&self, state: &mut WriterState) {
        let rotated = self.path.with_extension("log.1");
        let _ = state.file.flush();
        let _ = std::fs::rename(&self.path, &rotated);

        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            state.file = file;
            state.written = 0;
        }
    }
}

/// Read the last `tail` records (all when `None`)
pub fn read_log_tail(path: &Path, tail: Option<usize>) -> Result<Vec<LogRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)?;
    let mut records: Vec<LogRecord> = contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    if let Some(n) = tail {
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("container.log");
        let writer = LogWriter::open(&path, 1 << 20).unwrap();

        writer.write(StdStream::Stdout, b"hello\nwor");
        writer.write(StdStream::Stdout, b"ld\n");
        writer.write(StdStream::Stderr, b"oops\n");
        writer.flush();

        let records = read_log_tail(&path, None).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].log, "hello\n");
        assert_eq!(records[1].log, "world\n");
        assert_eq!(records[2].stream, StdStream::Stderr);

        let tail = read_log_tail(&path, Some(1)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].log, "oops\n");
    }

    #[test]
    fn test_partial_line_flushed_at_exit() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("container.log");
        let writer = LogWriter::open(&path, 1 << 20).unwrap();

        writer.write(StdStream::Stdout, b"no trailing newline");
        writer.flush();

        let records = read_log_tail(&path, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].log, "no trailing newline");
    }

    #[test]
    fn test_rotation() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("container.log");
        // Tiny threshold forces a rotation almost immediately
        let writer = LogWriter::open(&path, 256).unwrap();

        for i in 0..32 {
            writer.write(StdStream::Stdout, format!("line {}\n", i).as_bytes());
        }
        writer.flush();

        assert!(path.exists());
        assert!(path.with_extension("log.1").exists());
    }

    #[tokio::test]
    async fn test_followers_receive_typed_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("container.log");
        let writer = LogWriter::open(&path, 1 << 20).unwrap();

        assert_eq!(writer.followers().follower_count(), 0);
        let mut follower = writer.followers().follow();
        assert_eq!(writer.followers().follower_count(), 1);

        writer.write(StdStream::Stdout, b"streamed\n");
        writer.write(StdStream::Stderr, b"oops\n");

        let record = follower.recv().await.unwrap();
        assert_eq!(record.stream, StdStream::Stdout);
        assert_eq!(record.log, "streamed\n");

        let record = follower.recv().await.unwrap();
        assert_eq!(record.stream, StdStream::Stderr);
        assert_eq!(record.log, "oops\n");
    }
}
