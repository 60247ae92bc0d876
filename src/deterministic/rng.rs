//! Seeded xorshift128+ generator.

use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of a seed string.
pub fn fnv1a64(input: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// SplitMix64 expander used to derive generator words from one seed word.
#[derive(Clone, Debug)]
pub struct SplitMix64(u64);

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        SplitMix64(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

/// xorshift128+ with the same state update as V8's `Math.random`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xorshift128Plus {
    pub hi: u64,
    pub lo: u64,
}

impl Xorshift128Plus {
    pub fn from_seed(seed: &str) -> Self {
        let mut expander = SplitMix64::new(fnv1a64(seed));
        let hi = expander.next_u64();
        let mut lo = expander.next_u64();
        // All-zero state would stay zero forever.
        if hi == 0 && lo == 0 {
            lo = 1;
        }
        Self { hi, lo }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut s1 = self.hi;
        let s0 = self.lo;
        self.hi = s0;
        s1 ^= s1 << 23;
        s1 ^= s1 >> 17;
        s1 ^= s0;
        s1 ^= s0 >> 26;
        self.lo = s1;
        self.hi.wrapping_add(self.lo)
    }

    /// Uniform float in [0, 1) with 53 bits of precision.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
