//! Rotating set of packets already processed by this node.

use bitchat_protocol::DuplicateFilter;

/// Two-generation duplicate filter.
///
/// A single bloom filter saturates as a long-running node keeps inserting.
/// Once the current filter has taken `capacity` items it becomes the
/// previous generation and a fresh filter takes over, so memory stays flat
/// and recently seen packets are still caught.
#[derive(Debug, Clone)]
pub struct SeenMessages {
    current: DuplicateFilter,
    previous: Option<DuplicateFilter>,
    capacity: usize,
    rotations: u64,
}

impl SeenMessages {
    /// Creates an empty set sized for `capacity` items per generation.
    pub fn new(capacity: usize) -> bitchat_protocol::Result<Self> {
        Ok(Self {
            current: DuplicateFilter::adaptive(capacity)?,
            previous: None,
            capacity,
            rotations: 0,
        })
    }

    /// Returns `true` if `id` was seen before; records it otherwise.
    pub fn check_and_insert(&mut self, id: impl AsRef<[u8]>) -> bool {
        let id = id.as_ref();
        if self.previous.as_ref().is_some_and(|p| p.contains(id)) {
            return true;
        }
        if self.current.check_and_insert(id) {
            return true;
        }
        if self.current.inserted() >= self.capacity {
            self.rotate();
        }
        false
    }

    /// Whether `id` is in either generation.
    pub fn contains(&self, id: impl AsRef<[u8]>) -> bool {
        let id = id.as_ref();
        self.current.contains(id) || self.previous.as_ref().is_some_and(|p| p.contains(id))
    }

    /// Number of generations retired so far.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    fn rotate(&mut self) {
        let mut fresh = self.current.clone();
        fresh.reset();
        self.previous = Some(std::mem::replace(&mut self.current, fresh));
        self.rotations += 1;
        tracing::debug!(rotations = self.rotations, "rotated duplicate filter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_duplicates() {
        let mut seen = SeenMessages::new(100).unwrap();
        assert!(!seen.check_and_insert(b"a"));
        assert!(seen.check_and_insert(b"a"));
        assert!(seen.contains(b"a"));
        assert!(!seen.contains(b"b"));
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let mut seen = SeenMessages::new(4).unwrap();
        for i in 0u32..4 {
            assert!(!seen.check_and_insert(i.to_be_bytes()));
        }
        assert_eq!(seen.rotations(), 1);

        // Still caught through the previous generation
        assert!(seen.check_and_insert(0u32.to_be_bytes()));
        assert!(seen.check_and_insert(3u32.to_be_bytes()));
    }

    #[test]
    fn test_old_generation_is_forgotten() {
        let mut seen = SeenMessages::new(4).unwrap();
        for i in 0u32..8 {
            assert!(!seen.check_and_insert(i.to_be_bytes()));
        }
        assert_eq!(seen.rotations(), 2);

        // Items 0..4 lived in a generation that has now been dropped
        assert!(!seen.contains(0u32.to_be_bytes()));
        assert!(seen.contains(7u32.to_be_bytes()));
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(SeenMessages::new(0).is_err());
    }
}
