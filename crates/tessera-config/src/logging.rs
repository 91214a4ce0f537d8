use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

use crate::LoggingConfig;

/// Bounded tail of formatted log output.
///
/// The CLI reads it back when a command fails while stderr logging is off.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    /// Record formatted output, one entry per non-empty line.
    pub fn append(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = self.lines.lock();
        for line in text.lines().filter(|line| !line.is_empty()) {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_owned());
        }
    }

    /// Up to `n` of the newest lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let start = lines.len().saturating_sub(n);
        lines.range(start..).cloned().collect()
    }
}

/// `MakeWriter` that feeds each formatted event into a [`LogBuffer`].
#[derive(Clone)]
struct BufferSink(Arc<LogBuffer>);

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for BufferSink {
    type Writer = BufferSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

static LOG_BUFFER: OnceLock<Arc<LogBuffer>> = OnceLock::new();

/// Installs the global `tracing` subscriber on first call.
///
/// Later calls leave the subscriber alone and return the same buffer.
pub fn init_tracing(config: &LoggingConfig) -> Arc<LogBuffer> {
    LOG_BUFFER
        .get_or_init(|| {
            let buffer = Arc::new(LogBuffer::new(config.buffer_lines));
            install_subscriber(config, &buffer);
            buffer
        })
        .clone()
}

fn install_subscriber(config: &LoggingConfig, buffer: &Arc<LogBuffer>) {
    let mut writer = BoxMakeWriter::new(BufferSink(buffer.clone()));
    if config.stderr {
        // `TestWriter` goes through `eprint!` so the test harness can capture it.
        writer = if cfg!(debug_assertions) {
            BoxMakeWriter::new(writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr))
        } else {
            BoxMakeWriter::new(writer.and(io::stderr))
        };
    }

    let mut file_error = None;
    if let Some(path) = &config.file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            // `&File` is `Write`, so a shared handle serves every event.
            Ok(file) => writer = BoxMakeWriter::new(writer.and(Arc::new(file))),
            Err(err) => file_error = Some((path, err)),
        }
    }

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    if let Some((path, err)) = file_error {
        tracing::warn!(
            target: "tessera.config",
            path = %path.display(),
            error = %err,
            "failed to open log file; file logging disabled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn buffer_keeps_only_the_newest_lines() {
        let buffer = LogBuffer::new(3);
        buffer.append(b"one\ntwo\n");
        buffer.append(b"three\r\n\nfour\nfive");
        assert_eq!(buffer.recent(10), vec!["three", "four", "five"]);
        assert_eq!(buffer.recent(1), vec!["five"]);
        assert!(buffer.recent(0).is_empty());
    }

    #[test]
    fn sink_writes_land_in_the_buffer() {
        let buffer = Arc::new(LogBuffer::new(8));
        let sink = BufferSink(buffer.clone());
        sink.make_writer()
            .write_all(b"INFO tessera.cli: connecting\n")
            .unwrap();
        assert_eq!(buffer.recent(8), vec!["INFO tessera.cli: connecting"]);
    }

    #[test]
    fn init_tracing_returns_one_buffer_per_process() {
        let config = LoggingConfig {
            stderr: false,
            ..LoggingConfig::default()
        };
        let first = init_tracing(&config);
        let second = init_tracing(&LoggingConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
    }
}
