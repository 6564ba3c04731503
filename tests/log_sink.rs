// tests/log_sink.rs

use std::io;
use std::sync::{Arc, Mutex};

use procwarden::process::StreamName;
use procwarden::stream::{LogSink, MAX_PENDING_LINE, OutputChunk, Sink};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Buffer {
    type Writer = Buffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Feed `chunks` from pid 1000's stdout, then end the stream; return the
/// emitted log lines.
fn log_output(sink: &mut LogSink, chunks: &[&[u8]], end: bool) -> Vec<String> {
    let buffer = Buffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .without_time()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        for data in chunks {
            sink.deliver(&OutputChunk {
                watcher: "web",
                pid: 1000,
                stream: StreamName::Stdout,
                data,
            });
        }
        if end {
            sink.end_of_stream("web", 1000, StreamName::Stdout);
        }
    });
    buffer.lines()
}

#[test]
fn line_split_across_reads_is_one_event() {
    let mut sink = LogSink::default();

    let lines = log_output(&mut sink, &[b"hello wo", b"rld\nsecond"], false);

    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(": hello world"), "{lines:?}");
    assert_eq!(sink.pending_bytes(1000, StreamName::Stdout), 6);

    let lines = log_output(&mut sink, &[], true);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(": second"), "{lines:?}");
    assert_eq!(sink.pending_bytes(1000, StreamName::Stdout), 0);
}

#[test]
fn multibyte_character_split_across_reads_survives() {
    let mut sink = LogSink::default();
    let word = "café\n".as_bytes();
    let (head, tail) = word.split_at(4);

    let lines = log_output(&mut sink, &[head, tail], false);

    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(": café"), "{lines:?}");
    assert!(!lines[0].contains('\u{FFFD}'));
}

#[test]
fn streams_are_buffered_separately() {
    let mut sink = LogSink::default();
    sink.deliver(&OutputChunk {
        watcher: "web",
        pid: 1000,
        stream: StreamName::Stderr,
        data: b"partial",
    });

    let lines = log_output(&mut sink, &[b"out\n"], false);

    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(": out"), "{lines:?}");
    assert_eq!(sink.pending_bytes(1000, StreamName::Stderr), 7);
}

#[test]
fn overlong_line_is_not_held_forever() {
    let mut sink = LogSink::default();
    let long = vec![b'x'; MAX_PENDING_LINE];

    let lines = log_output(&mut sink, &[&long], false);

    assert_eq!(lines.len(), 1);
    assert_eq!(sink.pending_bytes(1000, StreamName::Stdout), 0);
}
