//! A generic background-thread JSONL writer.
//!
//! Three owners share this one implementation: the Flow Runner's
//! `runs.jsonl`, the MCP Router's `mcp_calls.jsonl`, and the Skill Execution
//! Guard's `telemetry/skills/events.jsonl`. Each owner gets its own writer
//! instance and its own file; the only shared thing is the pattern.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

/// Buffered, background-thread line writer with a configurable flush
/// cadence. Lines are appended to the underlying file; `close()` blocks until
/// every queued line has been written and flushed.
pub struct AsyncLineWriter {
    sender: Sender<Option<String>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncLineWriter {
    /// Opens (creating if necessary) `path` in append mode and starts the
    /// background thread. `flush_every` is the number of lines between
    /// explicit flushes; pass `1` for dev-fast / synchronous-feeling mode.
    pub fn open(path: impl AsRef<Path>, flush_every: usize) -> std::io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(&path)?;
        let flush_every = flush_every.max(1);
        let (sender, receiver) = mpsc::channel::<Option<String>>();

        let handle = std::thread::spawn(move || {
            let mut writer = BufWriter::new(file);
            let mut pending = 0usize;
            while let Ok(item) = receiver.recv() {
                match item {
                    Some(line) => {
                        let _ = writer.write_all(line.as_bytes());
                        let _ = writer.write_all(b"\n");
                        pending += 1;
                        if pending >= flush_every {
                            let _ = writer.flush();
                            pending = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush();
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Enqueues one pre-serialized JSON line (without trailing newline).
    /// Never blocks on I/O; silently drops the line if the writer thread has
    /// already exited (can only happen after `close()`).
    pub fn write_line(&self, line: String) {
        let _ = self.sender.send(Some(line));
    }

    /// Sends the shutdown sentinel and joins the background thread, ensuring
    /// every previously queued line is flushed to disk before returning.
    pub fn close(mut self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncLineWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    #[test]
    fn writes_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let writer = AsyncLineWriter::open(&path, 50).unwrap();
        for i in 0..5 {
            writer.write_line(format!("{{\"i\":{}}}", i));
        }
        writer.close();

        let file = File::open(&path).unwrap();
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "{\"i\":0}");
    }

    #[test]
    fn flush_every_one_still_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let writer = AsyncLineWriter::open(&path, 1).unwrap();
        writer.write_line("a".to_string());
        writer.write_line("b".to_string());
        writer.write_line("c".to_string());
        writer.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a\nb\nc\n");
    }
}
