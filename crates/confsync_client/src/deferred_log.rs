//! Log records captured before a subscriber exists.

use std::collections::VecDeque;
use tracing::Level;

/// Default number of records kept before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded buffer of log records, replayed through `tracing` once a
/// subscriber has been installed.
///
/// Option loading runs before the embedding application sets up logging, so
/// anything it wants to report is queued here instead of being lost.
#[derive(Debug)]
pub struct DeferredLog {
    records: VecDeque<(Level, String)>,
    capacity: usize,
    dropped: usize,
}

impl DeferredLog {
    /// Creates a buffer with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a buffer holding at most `capacity` records (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Queues a record at `level`.
    pub fn record(&mut self, level: Level, message: impl Into<String>) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back((level, message.into()));
    }

    /// Queues a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Level::WARN, message);
    }

    /// Queues an informational record.
    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Level::INFO, message);
    }

    /// Queues a debug record.
    pub fn debug(&mut self, message: impl Into<String>) {
        self.record(Level::DEBUG, message);
    }

    /// Returns the number of queued records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns how many records were discarded because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Iterates over queued records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = (Level, &str)> {
        self.records.iter().map(|(level, msg)| (*level, msg.as_str()))
    }

    /// Emits every queued record through `tracing`, oldest first, and
    /// returns how many were emitted.
    pub fn replay(self) -> usize {
        if self.dropped > 0 {
            tracing::warn!(dropped = self.dropped, "deferred log overflowed");
        }
        let count = self.records.len();
        for (level, message) in self.records {
            if level == Level::ERROR {
                tracing::error!(target: "confsync::deferred", "{message}");
            } else if level == Level::WARN {
                tracing::warn!(target: "confsync::deferred", "{message}");
            } else if level == Level::INFO {
                tracing::info!(target: "confsync::deferred", "{message}");
            } else if level == Level::DEBUG {
                tracing::debug!(target: "confsync::deferred", "{message}");
            } else {
                tracing::trace!(target: "confsync::deferred", "{message}");
            }
        }
        count
    }
}

impl Default for DeferredLog {
    fn default() -> Self {
        Self::new()
    }
}
