use std::collections::VecDeque;

/// A bounded, insertion-ordered cache of wire-encoded frames keyed by
/// sequence number, used as both the sent-frame replay buffer
/// (`stored_writes`) and the received-frame dedup/recovery buffer
/// (`stored_reads`).
///
/// Eviction is FIFO by insertion order rather than by numeric sequence,
/// since sequence numbers wrap and are not a safe ordering key.
pub struct ReplayCache {
    entries: VecDeque<(u32, Vec<u8>)>,
    max: u32,
    trim: u32,
}

impl ReplayCache {
    pub fn new(max: u32, trim: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            max,
            trim,
        }
    }

    pub fn insert(&mut self, sequence: u32, wire: Vec<u8>) {
        if self.entries.len() as u32 >= self.max {
            let drop_count = self.trim.min(self.entries.len() as u32);
            for _ in 0..drop_count {
                self.entries.pop_front();
            }
        }
        self.entries.push_back((sequence, wire));
    }

    pub fn get(&self, sequence: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(seq, _)| *seq == sequence)
            .map(|(_, wire)| wire.as_slice())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_oldest_by_insertion_order_once_full() {
        let mut cache = ReplayCache::new(4, 2);
        for i in 0..4 {
            cache.insert(i, vec![i as u8]);
        }
        assert_eq!(cache.len(), 4);

        cache.insert(4, vec![4]);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn get_missing_sequence_is_none() {
        let cache = ReplayCache::new(10, 5);
        assert!(cache.get(42).is_none());
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache = ReplayCache::new(10, 5);
        cache.insert(1, vec![1]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
