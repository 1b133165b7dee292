//! Reproducible per-replicate random streams.
//!
//! Every replicate gets its own MRG32k3a substream. Substream `i + 1` is
//! substream `i` jumped ahead by 2^127 steps, so a stream for `n` replicates is a
//! prefix of the stream for any larger count and never depends on how the
//! replicates are later split across workers.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

const M1: i64 = 4_294_967_087;
const M2: i64 = 4_294_944_443;
const A12: i64 = 1_403_580;
const A13N: i64 = 810_728;
const A21: i64 = 527_612;
const A23N: i64 = 1_370_589;
const NORM: f64 = 2.328_306_549_295_727_688e-10;

/// `A1^(2^127) mod m1`
const A1P127: [[u64; 3]; 3] = [
    [2_427_906_178, 3_580_155_704, 949_770_784],
    [226_153_695, 1_230_515_664, 3_580_155_704],
    [1_988_835_001, 986_791_581, 1_230_515_664],
];

/// `A2^(2^127) mod m2`
const A2P127: [[u64; 3]; 3] = [
    [1_464_411_153, 277_697_599, 1_610_723_613],
    [32_183_930, 1_464_411_153, 1_022_607_788],
    [2_824_425_944, 32_183_930, 2_093_834_863],
];

const SCRAMBLE_WARMUP: usize = 50;

/// Six-word MRG32k3a state. The first three words are below `m1`, the last three
/// below `m2`, and neither half is all zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedState([u32; 6]);

impl SeedState {
    /// Scrambles a 32-bit seed into a valid state with the 69069 LCG.
    pub fn from_seed(seed: u32) -> Self {
        let mut s = seed;
        for _ in 0..SCRAMBLE_WARMUP {
            s = lcg_step(s);
        }
        let mut words = [0u32; 6];
        for (j, word) in words.iter_mut().enumerate() {
            let modulus = if j < 3 { M1 } else { M2 };
            s = lcg_step(s);
            while i64::from(s) >= modulus {
                s = lcg_step(s);
            }
            *word = s;
        }
        // Consecutive LCG outputs cannot all be zero, so both halves are valid.
        SeedState(words)
    }

    pub fn words(&self) -> [u32; 6] {
        self.0
    }

    /// The first state of the next independent substream.
    pub fn next_stream(&self) -> Self {
        let s = self.0;
        let a = mat_vec_mod(&A1P127, [s[0], s[1], s[2]], M1 as u64);
        let b = mat_vec_mod(&A2P127, [s[3], s[4], s[5]], M2 as u64);
        SeedState([a[0], a[1], a[2], b[0], b[1], b[2]])
    }
}

fn lcg_step(s: u32) -> u32 {
    s.wrapping_mul(69_069).wrapping_add(1)
}

fn mat_vec_mod(a: &[[u64; 3]; 3], v: [u32; 3], m: u64) -> [u32; 3] {
    let mut out = [0u32; 3];
    for (i, row) in a.iter().enumerate() {
        let mut acc: u128 = 0;
        for (j, coeff) in row.iter().enumerate() {
            acc = (acc + u128::from(*coeff) * u128::from(v[j])) % u128::from(m);
        }
        out[i] = acc as u32;
    }
    out
}

/// MRG32k3a generator positioned at a [`SeedState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mrg32k3a {
    s: [i64; 6],
}

impl Mrg32k3a {
    pub fn from_state(state: SeedState) -> Self {
        let w = state.words();
        Self {
            s: [
                i64::from(w[0]),
                i64::from(w[1]),
                i64::from(w[2]),
                i64::from(w[3]),
                i64::from(w[4]),
                i64::from(w[5]),
            ],
        }
    }

    /// Non-reproducible generator seeded from the thread-local entropy source.
    pub fn from_entropy() -> Self {
        Self::from_state(SeedState::from_seed(rand::rng().random::<u32>()))
    }

    pub fn state(&self) -> SeedState {
        let mut words = [0u32; 6];
        for (w, s) in words.iter_mut().zip(self.s.iter()) {
            *w = *s as u32;
        }
        SeedState(words)
    }

    /// Advances both components and returns the combined value in `1..=m1`.
    fn step(&mut self) -> i64 {
        let p1 = (A12 * self.s[1] - A13N * self.s[0]).rem_euclid(M1);
        self.s[0] = self.s[1];
        self.s[1] = self.s[2];
        self.s[2] = p1;

        let p2 = (A21 * self.s[5] - A23N * self.s[3]).rem_euclid(M2);
        self.s[3] = self.s[4];
        self.s[4] = self.s[5];
        self.s[5] = p2;

        if p1 > p2 {
            p1 - p2
        } else {
            p1 - p2 + M1
        }
    }

    /// Uniform draw on the open interval (0, 1).
    pub fn next_uniform(&mut self) -> f64 {
        self.step() as f64 * NORM
    }
}

impl RngCore for Mrg32k3a {
    fn next_u32(&mut self) -> u32 {
        (self.step() - 1) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let hi = u64::from(self.next_u32());
        let lo = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Per-replicate seed states, indexed from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedStream {
    states: Vec<Option<SeedState>>,
}

impl SeedStream {
    /// Stream of `n` states derived from `base_seed`; `None` yields `n` null
    /// states meaning "draw from ambient entropy".
    pub fn generate(base_seed: Option<u32>, n: usize) -> Self {
        let states = match base_seed {
            None => vec![None; n],
            Some(seed) => {
                let mut states = Vec::with_capacity(n);
                let mut current = SeedState::from_seed(seed);
                for i in 0..n {
                    if i > 0 {
                        current = current.next_stream();
                    }
                    states.push(Some(current));
                }
                states
            }
        };
        Self { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State for the 1-based replicate `index`.
    pub fn get(&self, index: usize) -> Option<SeedState> {
        index
            .checked_sub(1)
            .and_then(|i| self.states.get(i))
            .copied()
            .flatten()
    }

    pub fn states(&self) -> &[Option<SeedState>] {
        &self.states
    }

    /// Generator for replicate `index`: positioned at its state, or seeded from
    /// entropy when the stream carries no state for it.
    pub fn rng_for(&self, index: usize) -> Mrg32k3a {
        match self.get(index) {
            Some(state) => Mrg32k3a::from_state(state),
            None => Mrg32k3a::from_entropy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrambled_state_respects_moduli() {
        for seed in [0u32, 1, 123, u32::MAX] {
            let w = SeedState::from_seed(seed).words();
            assert!(w[..3].iter().all(|x| i64::from(*x) < M1));
            assert!(w[3..].iter().all(|x| i64::from(*x) < M2));
            assert!(w[..3].iter().any(|x| *x != 0));
            assert!(w[3..].iter().any(|x| *x != 0));
        }
    }

    #[test]
    fn next_stream_stays_in_range_and_differs() {
        let s0 = SeedState::from_seed(42);
        let s1 = s0.next_stream();
        assert_ne!(s0, s1);
        let w = s1.words();
        assert!(w[..3].iter().all(|x| i64::from(*x) < M1));
        assert!(w[3..].iter().all(|x| i64::from(*x) < M2));
    }

    #[test]
    fn stream_is_prefix_stable() {
        let long = SeedStream::generate(Some(2024), 10);
        let short = SeedStream::generate(Some(2024), 5);
        assert_eq!(&long.states()[..5], short.states());
        assert_eq!(long.get(1), short.get(1));
        assert_eq!(long.get(0), None);
        assert_eq!(long.get(11), None);
    }

    #[test]
    fn null_seed_yields_null_states() {
        let stream = SeedStream::generate(None, 3);
        assert_eq!(stream.len(), 3);
        assert!(stream.states().iter().all(Option::is_none));
    }

    #[test]
    fn generator_is_deterministic_per_state() {
        let state = SeedState::from_seed(7);
        let mut a = Mrg32k3a::from_state(state);
        let mut b = Mrg32k3a::from_state(state);
        let xs: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();
        assert_eq!(xs, ys);
        for _ in 0..1000 {
            let u = a.next_uniform();
            assert!(u > 0.0 && u < 1.0);
        }
    }

    #[test]
    fn fill_bytes_handles_partial_chunks() {
        let mut rng = Mrg32k3a::from_state(SeedState::from_seed(9));
        let mut buf = [0u8; 7];
        rng.fill_bytes(&mut buf);
        let mut again = Mrg32k3a::from_state(SeedState::from_seed(9));
        let first = again.next_u32().to_le_bytes();
        assert_eq!(&buf[..4], &first);
    }
}
