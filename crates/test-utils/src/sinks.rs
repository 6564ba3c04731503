use std::sync::{Arc, Mutex};

use procwarden::process::{Pid, StreamName};
use procwarden::stream::{OutputChunk, Sink};

/// One delivered chunk, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub watcher: String,
    pub pid: Pid,
    pub stream: StreamName,
    pub data: Vec<u8>,
}

/// Sink that records everything it receives; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    chunks: Arc<Mutex<Vec<Captured>>>,
    ended: Arc<Mutex<Vec<(Pid, StreamName)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn Sink> {
        Box::new(self.clone())
    }

    pub fn chunks(&self) -> Vec<Captured> {
        self.chunks.lock().unwrap().clone()
    }

    /// Pipes reported finished, in order.
    pub fn ended(&self) -> Vec<(Pid, StreamName)> {
        self.ended.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        let bytes: Vec<u8> = self
            .chunks()
            .into_iter()
            .flat_map(|c| c.data)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Sink for CollectingSink {
    fn deliver(&mut self, chunk: &OutputChunk<'_>) {
        self.chunks.lock().unwrap().push(Captured {
            watcher: chunk.watcher.to_string(),
            pid: chunk.pid,
            stream: chunk.stream,
            data: chunk.data.to_vec(),
        });
    }

    fn end_of_stream(&mut self, _watcher: &str, pid: Pid, stream: StreamName) {
        self.ended.lock().unwrap().push((pid, stream));
    }
}
