use crate::layout::{Bucket, SENTINEL};

/// Bucket a key hashes to: plain modulo, so every process agrees on it
/// without sharing any hasher state.
pub fn bucket_of(key: u64, bucket_count: u32) -> u32 {
    (key % bucket_count as u64) as u32
}

/// The bucket table: one chain head per bucket.
pub(crate) struct HashIndex<'a> {
    buckets: &'a mut [Bucket],
}

impl<'a> HashIndex<'a> {
    pub fn new(buckets: &'a mut [Bucket]) -> Self {
        Self { buckets }
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn bucket_of(&self, key: u64) -> u32 {
        bucket_of(key, self.bucket_count())
    }

    /// Raw link of the chain head, `-1` if the bucket is empty.
    pub fn head(&self, bucket: u32) -> i32 {
        self.buckets[bucket as usize].location
    }

    pub fn set_head(&mut self, bucket: u32, link: i32) {
        self.buckets[bucket as usize].location = link;
    }

    /// Empties every bucket.
    pub fn reset(&mut self) {
        self.buckets.fill(Bucket { location: SENTINEL });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bucket_of_is_modulo() {
        assert_eq!(bucket_of(42, 256), 42);
        assert_eq!(bucket_of(256, 256), 0);
        assert_eq!(bucket_of(u64::MAX, 256), 255);
        assert_eq!(bucket_of(12345, 1), 0);
    }

    #[test]
    fn test_heads() {
        let mut buckets = vec![Bucket { location: 7 }; 4];
        let mut index = HashIndex::new(&mut buckets);
        index.reset();
        assert_eq!(index.head(2), SENTINEL);
        index.set_head(index.bucket_of(6), 3);
        assert_eq!(index.head(2), 3);
        assert_eq!(buckets[2].location, 3);
    }

    proptest! {
        #[test]
        fn prop_consecutive_keys_spread_evenly(start in any::<u32>(), buckets in 1u32..512) {
            let mut counts = vec![0u32; buckets as usize];
            for key in start as u64..start as u64 + buckets as u64 * 4 {
                counts[bucket_of(key, buckets) as usize] += 1;
            }
            prop_assert!(counts.iter().all(|&c| c == 4));
        }
    }
}
