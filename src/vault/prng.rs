//! CPython-compatible pseudo-random generator.
//!
//! The cipher-chain schedule for stored secrets was generated with CPython's
//! `random` module seeded from derived key bytes. Unwrapping those secrets
//! requires the *identical* stream: MT19937 with `init_by_array` seeding,
//! byte seeds expanded via `seed ∥ SHA-512(seed)` interpreted as a big-endian
//! integer, and `randint` built on rejection-sampled `getrandbits`.

use sha2::{Digest, Sha512};

const N: usize = 624;
const M: usize = 397;
const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// MT19937 core (Matsumoto–Nishimura reference semantics).
struct Mt19937 {
    mt: [u32; N],
    mti: usize,
}

impl Mt19937 {
    fn from_u32(seed: u32) -> Self {
        let mut rng = Self {
            mt: [0; N],
            mti: N + 1,
        };
        rng.init_genrand(seed);
        rng
    }

    fn init_genrand(&mut self, seed: u32) {
        self.mt[0] = seed;
        for i in 1..N {
            let prev = self.mt[i - 1];
            self.mt[i] = 1_812_433_253u32
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        self.mti = N;
    }

    fn from_key(key: &[u32]) -> Self {
        let mut rng = Self::from_u32(19_650_218);
        let mut i = 1usize;
        let mut j = 0usize;
        let mut k = N.max(key.len());
        while k > 0 {
            let prev = rng.mt[i - 1] ^ (rng.mt[i - 1] >> 30);
            rng.mt[i] = (rng.mt[i] ^ prev.wrapping_mul(1_664_525))
                .wrapping_add(key[j])
                .wrapping_add(j as u32);
            i += 1;
            j += 1;
            if i >= N {
                rng.mt[0] = rng.mt[N - 1];
                i = 1;
            }
            if j >= key.len() {
                j = 0;
            }
            k -= 1;
        }
        k = N - 1;
        while k > 0 {
            let prev = rng.mt[i - 1] ^ (rng.mt[i - 1] >> 30);
            rng.mt[i] = (rng.mt[i] ^ prev.wrapping_mul(1_566_083_941)).wrapping_sub(i as u32);
            i += 1;
            if i >= N {
                rng.mt[0] = rng.mt[N - 1];
                i = 1;
            }
            k -= 1;
        }
        rng.mt[0] = 0x8000_0000;
        rng.mti = N;
        rng
    }

    fn genrand_u32(&mut self) -> u32 {
        if self.mti >= N {
            for kk in 0..N - M {
                let y = (self.mt[kk] & UPPER_MASK) | (self.mt[kk + 1] & LOWER_MASK);
                self.mt[kk] = self.mt[kk + M] ^ (y >> 1) ^ if y & 1 == 1 { MATRIX_A } else { 0 };
            }
            for kk in N - M..N - 1 {
                let y = (self.mt[kk] & UPPER_MASK) | (self.mt[kk + 1] & LOWER_MASK);
                self.mt[kk] =
                    self.mt[kk + M - N] ^ (y >> 1) ^ if y & 1 == 1 { MATRIX_A } else { 0 };
            }
            let y = (self.mt[N - 1] & UPPER_MASK) | (self.mt[0] & LOWER_MASK);
            self.mt[N - 1] = self.mt[M - 1] ^ (y >> 1) ^ if y & 1 == 1 { MATRIX_A } else { 0 };
            self.mti = 0;
        }

        let mut y = self.mt[self.mti];
        self.mti += 1;
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        y
    }
}

/// `random.Random` seeded from bytes, exposing the `randint` subset the
/// schedule generation uses.
pub struct PyRandom {
    mt: Mt19937,
}

impl PyRandom {
    /// `random.seed(bytes)`: the seed integer is
    /// `int.from_bytes(seed + sha512(seed).digest(), "big")`, handed to
    /// `init_by_array` as 32-bit digits, least significant first.
    pub fn seed_bytes(seed: &[u8]) -> Self {
        let mut material = seed.to_vec();
        material.extend_from_slice(&Sha512::digest(seed));
        Self {
            mt: Mt19937::from_key(&int_digits_le(&material)),
        }
    }

    /// `random.getrandbits(k)` for `0 < k <= 32`.
    fn getrandbits(&mut self, k: u32) -> u32 {
        debug_assert!(k >= 1 && k <= 32);
        self.mt.genrand_u32() >> (32 - k)
    }

    /// `random._randbelow(n)`: rejection sampling over `n.bit_length()` bits.
    fn randbelow(&mut self, n: u32) -> u32 {
        debug_assert!(n > 0);
        let k = 32 - n.leading_zeros();
        loop {
            let r = self.getrandbits(k);
            if r < n {
                return r;
            }
        }
    }

    /// `random.randint(0, upper)` inclusive.
    pub fn randint0(&mut self, upper: u32) -> u32 {
        self.randbelow(upper + 1)
    }
}

/// Big-endian byte string -> the 32-bit digits of its integer value, least
/// significant digit first (leading zero bytes contribute nothing, exactly
/// like the integer conversion they model).
fn int_digits_le(bytes: &[u8]) -> Vec<u32> {
    let significant = match bytes.iter().position(|&b| b != 0) {
        Some(idx) => &bytes[idx..],
        None => return vec![0],
    };
    let mut digits = Vec::with_capacity(significant.len() / 4 + 1);
    let mut chunk_end = significant.len();
    while chunk_end > 0 {
        let chunk_start = chunk_end.saturating_sub(4);
        let mut word = 0u32;
        for &b in &significant[chunk_start..chunk_end] {
            word = (word << 8) | u32::from(b);
        }
        digits.push(word);
        chunk_end = chunk_start;
    }
    digits
}
