/// Stable 64-bit hash of a string, identical across platforms and runs.
///
/// Used wherever tests are assigned to buckets, so that the same test lands in the same bucket
/// for the same bucket count.
pub fn stable_hash(s: &str) -> u64 {
    let digest = blake3::hash(s.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word)
}

/// Which of `num_buckets` buckets `s` falls into. Zero buckets behave as one.
pub fn bucket_of(s: &str, num_buckets: usize) -> usize {
    let num_buckets = num_buckets.max(1) as u64;
    (stable_hash(s) % num_buckets) as usize
}

#[cfg(test)]
mod test {
    use super::{bucket_of, stable_hash};

    #[test]
    fn consistent_for_same_input() {
        assert_eq!(stable_hash("/dom/a.html"), stable_hash("/dom/a.html"));
    }

    #[test]
    fn different_for_different_input() {
        assert_ne!(stable_hash("/dom/a.html"), stable_hash("/dom/b.html"));
    }

    #[test]
    fn buckets_in_range() {
        for i in 0..100 {
            let id = format!("/test/{i}.html");
            assert!(bucket_of(&id, 7) < 7);
            assert_eq!(bucket_of(&id, 0), 0);
            assert_eq!(bucket_of(&id, 1), 0);
        }
    }
}
