use bytes::Bytes;
use lru::LruCache;

/// Byte-budgeted LRU over image payloads.
pub struct MemoryTier {
    entries: LruCache<String, Bytes>,
    budget: usize,
    bytes_used: usize,
}

impl MemoryTier {
    pub fn new(budget: usize) -> Self {
        MemoryTier {
            entries: LruCache::unbounded(),
            budget,
            bytes_used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Looks up `key` and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    /// Looks up `key` without touching its recency.
    pub fn peek(&self, key: &str) -> Option<&Bytes> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Inserts or replaces `key`, returning the keys evicted to stay within
    /// budget. A payload larger than the whole budget is not kept, and any
    /// older value under the same key is dropped with it.
    pub fn insert(&mut self, key: String, bytes: Bytes) -> Vec<String> {
        if let Some(existing) = self.entries.pop(&key) {
            self.bytes_used = self.bytes_used.saturating_sub(existing.len());
        }

        let size = bytes.len();
        if size > self.budget {
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.bytes_used + size > self.budget {
            match self.entries.pop_lru() {
                Some((old_key, old)) => {
                    self.bytes_used = self.bytes_used.saturating_sub(old.len());
                    evicted.push(old_key);
                }
                None => break,
            }
        }

        self.bytes_used += size;
        self.entries.put(key, bytes);
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let removed = self.entries.pop(key);
        if let Some(ref bytes) = removed {
            self.bytes_used = self.bytes_used.saturating_sub(bytes.len());
        }
        removed
    }

    /// Empties the tier, handing back everything it held.
    pub fn drain(&mut self) -> Vec<(String, Bytes)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_lru() {
            drained.push(entry);
        }
        self.bytes_used = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let mut tier = MemoryTier::new(300);
        tier.insert("a".into(), payload(100));
        tier.insert("b".into(), payload(100));
        tier.insert("c".into(), payload(100));

        // Touch "a" so "b" becomes the oldest.
        assert!(tier.get("a").is_some());

        let evicted = tier.insert("d".into(), payload(100));
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(tier.contains("a"));
        assert!(tier.contains("c"));
        assert!(tier.contains("d"));
        assert_eq!(tier.bytes_used(), 300);
    }

    #[test]
    fn evicts_as_many_as_needed_and_no_more() {
        let mut tier = MemoryTier::new(400);
        for key in ["a", "b", "c", "d"] {
            tier.insert(key.into(), payload(100));
        }
        tier.get("a");
        tier.get("c");

        // Needs 200 bytes free: b and d go, a and c stay.
        let evicted = tier.insert("big".into(), payload(200));
        assert_eq!(evicted, vec!["b".to_string(), "d".to_string()]);
        assert!(tier.contains("a"));
        assert!(tier.contains("c"));
        assert_eq!(tier.len(), 3);
        assert_eq!(tier.bytes_used(), 400);
    }

    #[test]
    fn replacing_a_key_keeps_accounting_exact() {
        let mut tier = MemoryTier::new(1000);
        tier.insert("a".into(), payload(100));
        tier.insert("a".into(), payload(40));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes_used(), 40);
        assert_eq!(tier.get("a").unwrap().len(), 40);
    }

    #[test]
    fn oversized_payload_is_not_kept() {
        let mut tier = MemoryTier::new(50);
        tier.insert("small".into(), payload(10));
        let evicted = tier.insert("huge".into(), payload(51));
        assert!(evicted.is_empty());
        assert!(!tier.contains("huge"));
        assert!(tier.contains("small"));
    }
}
