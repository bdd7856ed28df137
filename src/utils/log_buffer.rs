//! Keeps the most recent log lines in memory for the console's `logs`
//! command, while env_logger still writes everything to stderr.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{Log, Metadata, Record, SetLoggerError};

pub const DEFAULT_LOG_HISTORY: usize = 500;

/// Bounded ring of formatted log lines. Clones share the same ring.
#[derive(Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_HISTORY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Up to `count` of the newest lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// env_logger, plus a copy of every record it accepts into a `LogBuffer`.
pub struct BufferedLogger {
    inner: env_logger::Logger,
    buffer: LogBuffer,
}

impl BufferedLogger {
    pub fn new(inner: env_logger::Logger, buffer: LogBuffer) -> Self {
        Self { inner, buffer }
    }

    /// Install as the global logger with env_logger's level filter.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let max_level = self.inner.filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for BufferedLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.inner.matches(record) {
            return;
        }
        self.buffer.push(format!(
            "{} {:<5} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            record.target(),
            record.args()
        ));
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    #[test]
    fn keeps_only_the_newest_lines() {
        let buffer = LogBuffer::new(3);
        for n in 0..5 {
            buffer.push(format!("line {n}"));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.recent(10), ["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.recent(2), ["line 3", "line 4"]);
        assert!(buffer.recent(0).is_empty());
    }

    #[test]
    fn records_below_the_filter_are_not_kept() {
        let inner = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .build();
        let buffer = LogBuffer::new(8);
        let logger = BufferedLogger::new(inner, buffer.clone());

        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("watchlink_lib::session")
                .args(format_args!("chatty"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("watchlink_lib::session")
                .args(format_args!("session closed"))
                .build(),
        );

        let lines = buffer.recent(8);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("WARN  watchlink_lib::session: session closed"));
    }
}
