//! Pluggable digest primitive.
//!
//! The hasher is generic over [`Digest`] so the algorithm can be swapped
//! without touching partitioning or combination. [`Blake3`] is the default.

/// Incremental hash state
pub trait Digest: Default + Send + 'static {
    /// Algorithm name, for logging
    const NAME: &'static str;

    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Finish and return the digest bytes
    fn finalize(self) -> Vec<u8>;

    /// One-shot digest of `data`
    fn digest(data: &[u8]) -> Vec<u8> {
        let mut state = Self::default();
        state.update(data);
        state.finalize()
    }
}

/// BLAKE3 (32-byte output)
#[derive(Default)]
pub struct Blake3(blake3::Hasher);

impl Digest for Blake3 {
    const NAME: &'static str = "blake3";

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> Vec<u8> {
        self.0.finalize().as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_matches_reference() {
        let expected = blake3::hash(b"sluice").as_bytes().to_vec();
        assert_eq!(Blake3::digest(b"sluice"), expected);
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let mut state = Blake3::default();
        state.update(b"hello, ");
        state.update(b"world");
        assert_eq!(state.finalize(), Blake3::digest(b"hello, world"));
    }
}
