// src/stream/mod.rs

//! Output capture: pipe registration ([`redirector`]) and delivery
//! ([`sink`]).

pub mod redirector;
pub mod sink;

pub use redirector::{Redirection, StreamRedirector};
pub use sink::{FileSink, LogSink, MAX_PENDING_LINE, NullSink, OutputChunk, Sink, SinkConfig};
