//! Incremental key hashing for the row aggregator

/// Rolling 64-bit hash fed one key byte at a time
///
/// The aggregator hashes while it scans for the `;` separator, so the hasher
/// is a pair of associated functions rather than a `std::hash::Hasher`.
pub trait KeyHasher {
    fn start() -> u64;
    fn step(state: u64, byte: u8) -> u64;
}

/// 64-bit FNV-1a
pub struct Fnv1a;

impl Fnv1a {
    const OFFSET: u64 = 14_695_981_039_346_656_037;
    const PRIME: u64 = 1_099_511_628_211;

    /// Hash a whole key at once
    pub fn hash(bytes: &[u8]) -> u64 {
        bytes
            .iter()
            .fold(Self::start(), |state, &b| Self::step(state, b))
    }
}

impl KeyHasher for Fnv1a {
    #[inline(always)]
    fn start() -> u64 {
        Self::OFFSET
    }

    #[inline(always)]
    fn step(state: u64, byte: u8) -> u64 {
        (state ^ u64::from(byte)).wrapping_mul(Self::PRIME)
    }
}
