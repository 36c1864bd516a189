//! Bounded dedup window keyed on delivery id.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Remembers recently accepted delivery ids for a bounded time and count
#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    capacity: usize,

    /// Delivery id -> when it was accepted
    seen: HashMap<String, Instant>,

    /// Insertion order, oldest first
    order: VecDeque<(String, Instant)>,
}

impl DedupWindow {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a delivery id; returns false if it is already in the window
    pub fn insert(&mut self, delivery_id: &str) -> bool {
        let now = Instant::now();
        self.evict(now);

        if self.seen.contains_key(delivery_id) {
            return false;
        }

        self.seen.insert(delivery_id.to_string(), now);
        self.order.push_back((delivery_id.to_string(), now));

        while self.seen.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
        true
    }

    /// Check whether a delivery id is in the window
    pub fn contains(&mut self, delivery_id: &str) -> bool {
        self.evict(Instant::now());
        self.seen.contains_key(delivery_id)
    }

    /// Drop a delivery id so a redelivery is accepted again
    pub fn forget(&mut self, delivery_id: &str) -> bool {
        // The stale entry in `order` is skipped when it reaches the front
        self.seen.remove(delivery_id).is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((_, accepted_at)) = self.order.front() {
            if now.duration_since(*accepted_at) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    /// Remove the oldest entry; false when the queue is empty
    fn pop_oldest(&mut self) -> bool {
        let Some((id, accepted_at)) = self.order.pop_front() else {
            return false;
        };
        // Only remove the id if it was not forgotten and re-inserted since
        if self.seen.get(&id) == Some(&accepted_at) {
            self.seen.remove(&id);
        }
        true
    }
}
