//! Randomness for `random_get` and `getentropy`.

use weh_common::Errno;

/// Source of random bytes for the guest.
pub trait EntropySource: Send {
    /// Fill `buf` completely.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Errno>;
}

/// Operating-system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Errno> {
        getrandom::getrandom(buf).map_err(|_| Errno::Io)
    }
}

/// Deterministic byte generator for reproducible runs.
///
/// Not suitable for anything that needs real randomness.
#[derive(Debug, Clone)]
pub struct SeededEntropy {
    state: u64,
}

impl SeededEntropy {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next(&mut self) -> u64 {
        // splitmix64
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl EntropySource for SeededEntropy {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Errno> {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_entropy_fills() {
        let mut buf = [0u8; 64];
        OsEntropy.fill(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let mut a = [0u8; 13];
        let mut b = [0u8; 13];
        SeededEntropy::new(7).fill(&mut a).unwrap();
        SeededEntropy::new(7).fill(&mut b).unwrap();
        assert_eq!(a, b);

        let mut c = [0u8; 13];
        SeededEntropy::new(8).fill(&mut c).unwrap();
        assert_ne!(a, c);
    }
}
