// src/stream/sink.rs

//! Destinations for captured process output.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::logging::OUTPUT_TARGET;
use crate::process::{Pid, StreamName};

/// One chunk of bytes read from a process pipe.
#[derive(Debug, Clone, Copy)]
pub struct OutputChunk<'a> {
    pub watcher: &'a str,
    pub pid: Pid,
    pub stream: StreamName,
    pub data: &'a [u8],
}

pub trait Sink {
    fn deliver(&mut self, chunk: &OutputChunk<'_>);

    /// No more output will arrive from this pipe.
    fn end_of_stream(&mut self, _watcher: &str, _pid: Pid, _stream: StreamName) {}
}

/// Configured destination for one stream of a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SinkConfig {
    #[default]
    Log,
    Null,
    File(PathBuf),
}

impl SinkConfig {
    /// Whether the process needs a pipe for this stream at all.
    pub fn wants_pipe(&self) -> bool {
        !matches!(self, SinkConfig::Null)
    }

    pub fn build(&self) -> io::Result<Box<dyn Sink>> {
        Ok(match self {
            SinkConfig::Log => Box::new(LogSink::default()),
            SinkConfig::Null => Box::new(NullSink),
            SinkConfig::File(path) => Box::new(FileSink::open(path.clone())?),
        })
    }
}

/// A line longer than this is emitted in pieces.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Re-emits output as tracing events, one per line.
///
/// Reads can split a line (or a multibyte character) anywhere, so the
/// unterminated tail of each pipe is held until its newline arrives or the
/// pipe ends.
#[derive(Debug, Default)]
pub struct LogSink {
    pending: HashMap<(Pid, StreamName), Vec<u8>>,
}

impl LogSink {
    pub fn pending_bytes(&self, pid: Pid, stream: StreamName) -> usize {
        self.pending.get(&(pid, stream)).map_or(0, Vec::len)
    }
}

fn emit_lines(watcher: &str, pid: Pid, stream: StreamName, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines().filter(|l| !l.is_empty()) {
        info!(
            target: OUTPUT_TARGET,
            watcher = %watcher,
            pid,
            stream = %stream,
            "{line}"
        );
    }
}

impl Sink for LogSink {
    fn deliver(&mut self, chunk: &OutputChunk<'_>) {
        let key = (chunk.pid, chunk.stream);
        let buf = self.pending.entry(key).or_default();
        buf.extend_from_slice(chunk.data);

        let split = match buf.iter().rposition(|b| *b == b'\n') {
            Some(newline) => newline + 1,
            None if buf.len() >= MAX_PENDING_LINE => buf.len(),
            None => return,
        };
        let complete: Vec<u8> = buf.drain(..split).collect();
        if buf.is_empty() {
            self.pending.remove(&key);
        }
        emit_lines(chunk.watcher, chunk.pid, chunk.stream, &complete);
    }

    fn end_of_stream(&mut self, watcher: &str, pid: Pid, stream: StreamName) {
        if let Some(rest) = self.pending.remove(&(pid, stream)) {
            emit_lines(watcher, pid, stream, &rest);
        }
    }
}

#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn deliver(&mut self, _chunk: &OutputChunk<'_>) {}
}

/// Appends raw bytes to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }
}

impl Sink for FileSink {
    fn deliver(&mut self, chunk: &OutputChunk<'_>) {
        if let Err(e) = self.file.write_all(chunk.data) {
            warn!(
                path = %self.path.display(),
                watcher = %chunk.watcher,
                error = %e,
                "dropping output: file sink write failed"
            );
        }
    }
}
