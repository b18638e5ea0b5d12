use std::collections::{HashMap, VecDeque};

/// Event ids already relayed, bounded by count and age.
///
/// Only suppresses duplicate forwarding. Losing it (e.g. on restart) is
/// harmless because the persisted sync cursor and the start-time cutoff
/// keep old events out anyway.
pub struct ProcessedMessageRegistry {
    seen: HashMap<String, u64>,
    /// Insertion order for eviction.
    order: VecDeque<(String, u64)>,
    capacity: usize,
    ttl_ms: u64,
}

impl ProcessedMessageRegistry {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl_ms,
        }
    }

    pub fn contains(&self, event_id: &str, now: u64) -> bool {
        self.seen
            .get(event_id)
            .is_some_and(|at| now.saturating_sub(*at) < self.ttl_ms)
    }

    /// Record `event_id`. Returns `false` if it was already present.
    pub fn insert(&mut self, event_id: &str, now: u64) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(event_id) {
            return false;
        }
        while self.seen.len() >= self.capacity {
            let Some((oldest, _)) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&oldest);
        }
        self.seen.insert(event_id.to_string(), now);
        self.order.push_back((event_id.to_string(), now));
        true
    }

    pub fn evict_expired(&mut self, now: u64) {
        while let Some((id, at)) = self.order.front() {
            if now.saturating_sub(*at) < self.ttl_ms {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_insert_is_rejected() {
        let mut registry = ProcessedMessageRegistry::new(10, 1_000);
        assert!(registry.insert("$a", 0));
        assert!(!registry.insert("$a", 1));
        assert!(registry.contains("$a", 2));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut registry = ProcessedMessageRegistry::new(2, 1_000);
        registry.insert("$a", 0);
        registry.insert("$b", 1);
        registry.insert("$c", 2);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains("$a", 3));
        assert!(registry.contains("$c", 3));
    }

    #[test]
    fn entries_expire() {
        let mut registry = ProcessedMessageRegistry::new(10, 100);
        registry.insert("$a", 0);
        assert!(!registry.contains("$a", 100));
        registry.evict_expired(100);
        assert!(registry.is_empty());
        assert!(registry.insert("$a", 150));
    }
}
