use std::collections::BTreeMap;

/// Releases out-of-order completions in sequence order.
///
/// Holds at most `window` pending items. When that is exceeded the missing
/// sequence numbers are skipped so a lost completion can't stall the stream.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, T>,
    next: u64,
    window: usize,
    skipped: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(window: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
            window: window.max(1),
            skipped: 0,
        }
    }

    /// Queues `item`. An item behind the release point is handed back.
    pub fn insert(&mut self, seq: u64, item: T) -> Result<(), T> {
        if seq < self.next {
            return Err(item);
        }
        self.pending.insert(seq, item);
        Ok(())
    }

    /// Everything now releasable, in sequence order.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        loop {
            if let Some(item) = self.pending.remove(&self.next) {
                ready.push(item);
                self.next += 1;
                continue;
            }
            if self.pending.len() <= self.window {
                break;
            }
            // Give up on the gap and resume at the oldest pending item.
            if let Some((&oldest, _)) = self.pending.first_key_value() {
                self.skipped += oldest - self.next;
                tracing::warn!(
                    "Reorder window full, skipping sequence {}..{}",
                    self.next,
                    oldest
                );
                self.next = oldest;
            }
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
