use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::models::RawSignal;

/// Inbound boundary for the chat platform client.
///
/// `ingest` is push-based and never blocks the caller; instead of applying
/// backpressure upstream (we cannot pause a chat feed), the buffer evicts
/// messages that have gone stale, oldest first.
pub struct SourceAdapter {
    buffer: Mutex<VecDeque<RawSignal>>,
    capacity: usize,
    max_age: ChronoDuration,
    wakeup: Notify,
}

impl SourceAdapter {
    pub fn new(capacity: usize, max_age_secs: u64) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
            max_age: ChronoDuration::seconds(max_age_secs as i64),
            wakeup: Notify::new(),
        }
    }

    /// Sole inbound entry point for raw chat signals
    pub fn ingest(&self, signal: RawSignal) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            self.evict_stale(&mut buffer);

            if buffer.len() >= self.capacity {
                if let Some(dropped) = buffer.pop_front() {
                    tracing::warn!(
                        "dropped_stale_signal: inbound buffer full, dropping oldest {} from {}",
                        dropped.source_id,
                        dropped.channel
                    );
                }
            }

            buffer.push_back(signal);
        }
        self.wakeup.notify_one();
    }

    /// Next unread signal; waits when the buffer is empty. Signals that went
    /// stale while queued are skipped.
    pub async fn next(&self) -> RawSignal {
        loop {
            {
                let mut buffer = self.buffer.lock().unwrap();
                self.evict_stale(&mut buffer);
                if let Some(signal) = buffer.pop_front() {
                    return signal;
                }
            }
            self.wakeup.notified().await;
        }
    }

    /// Non-waiting variant used while draining on shutdown
    pub fn try_next(&self) -> Option<RawSignal> {
        let mut buffer = self.buffer.lock().unwrap();
        self.evict_stale(&mut buffer);
        buffer.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_stale(&self, buffer: &mut VecDeque<RawSignal>) {
        let cutoff = Utc::now() - self.max_age;
        while let Some(front) = buffer.front() {
            if front.timestamp >= cutoff {
                break;
            }
            let dropped = buffer.pop_front().unwrap();
            tracing::warn!(
                "dropped_stale_signal: {} from {} aged out unread",
                dropped.source_id,
                dropped.channel
            );
        }
    }
}
