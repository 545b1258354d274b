use log::{Level, Log, Metadata, Record};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct Line {
    timestamp_ms: u64,
    level: &'static str,
    target: String,
    message: String,
}

/// Bounded ring buffer of serialized log lines. Once full, the oldest
/// queued line is dropped to make room for the newest one rather than
/// blocking the logging call site.
struct Queue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Queue {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn drain(&self) -> VecDeque<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

/// `log::Log` implementation that serializes each record to a single-line
/// JSON object and hands it to a dedicated writer thread via a bounded,
/// drop-oldest queue, so a burst of logging never blocks the caller.
pub struct JsonLogger {
    level: Level,
    queue: Arc<Queue>,
}

impl JsonLogger {
    /// Installs a `JsonLogger` as the global logger and spawns its
    /// writer thread. Must be called at most once per process.
    pub fn install(level: Level, queue_capacity: usize) -> Result<(), log::SetLoggerError> {
        let queue = Arc::new(Queue {
            lines: Mutex::new(VecDeque::with_capacity(queue_capacity.max(1))),
            capacity: queue_capacity.max(1),
        });

        spawn_writer(queue.clone());

        log::set_max_level(level.to_level_filter());
        log::set_boxed_logger(Box::new(Self { level, queue }))
    }
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = Line {
            timestamp_ms: now_millis(),
            level: level_str(record.level()),
            target: record.target().to_string(),
            message: record.args().to_string(),
        };

        if let Ok(serialized) = serde_json::to_string(&line) {
            self.queue.push(serialized);
        }
    }

    fn flush(&self) {
        for line in self.queue.drain() {
            println!("{line}");
        }
    }
}

fn spawn_writer(queue: Arc<Queue>) {
    thread::spawn(move || loop {
        for line in queue.drain() {
            println!("{line}");
        }
        thread::sleep(DRAIN_INTERVAL);
    });
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warn",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
