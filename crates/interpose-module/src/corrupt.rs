//! Random corruption of relayed data.
//!
//! Each unit gets `count` (or `max(1, len * rate)`) distinct positions
//! mutated. In byte mode a position is shifted by a non-zero amount mod 256;
//! in bit mode a single bit is flipped. Per-pair generators are seeded from
//! one master generator so a configured `seed` makes a whole run repeatable.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::ModuleError;
use crate::module::{Direction, Module, ModuleFactory, PairInfo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptMode {
    #[default]
    Bytes,
    Bits,
}

/// Which directions a module acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    /// A→B only.
    Request,
    /// B→A only.
    Response,
    #[default]
    Both,
}

impl DirectionFilter {
    pub fn matches(self, direction: Direction) -> bool {
        match self {
            DirectionFilter::Request => direction.is_a_to_b(),
            DirectionFilter::Response => !direction.is_a_to_b(),
            DirectionFilter::Both => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorruptOptions {
    #[serde(default)]
    pub mode: CorruptMode,
    /// Fraction of units (bytes or bits) to mutate.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Exact number of units to mutate; overrides `rate`.
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub direction: DirectionFilter,
}

fn default_rate() -> f64 {
    interpose_core::DEFAULT_CORRUPT_RATE
}

impl Default for CorruptOptions {
    fn default() -> Self {
        Self {
            mode: CorruptMode::default(),
            rate: default_rate(),
            count: None,
            seed: None,
            direction: DirectionFilter::default(),
        }
    }
}

impl CorruptOptions {
    pub fn validate(&self) -> Result<(), ModuleError> {
        if !(0.0..=1.0).contains(&self.rate) {
            return Err(ModuleError::Invalid(format!(
                "corrupt rate must be within 0..=1, got {}",
                self.rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CorruptFactory {
    options: CorruptOptions,
    master: Mutex<StdRng>,
}

impl CorruptFactory {
    pub fn new(options: CorruptOptions) -> Result<Self, ModuleError> {
        options.validate()?;
        let master = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            options,
            master: Mutex::new(master),
        })
    }
}

impl ModuleFactory for CorruptFactory {
    fn name(&self) -> &'static str {
        "corrupt"
    }

    fn create(&self, _pair: &PairInfo) -> Result<Box<dyn Module>, ModuleError> {
        let seed: u64 = self.master.lock().r#gen();
        Ok(Box::new(Corrupt {
            options: self.options.clone(),
            rng: StdRng::seed_from_u64(seed),
        }))
    }
}

pub struct Corrupt {
    options: CorruptOptions,
    rng: StdRng,
}

impl Corrupt {
    fn amount(&self, units: usize) -> usize {
        match self.options.count {
            Some(count) => count.min(units),
            None if self.options.rate <= 0.0 => 0,
            None => ((units as f64 * self.options.rate) as usize).clamp(1, units),
        }
    }
}

impl Module for Corrupt {
    fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
        if data.is_empty() || !self.options.direction.matches(direction) {
            return Some(data);
        }
        let units = match self.options.mode {
            CorruptMode::Bytes => data.len(),
            CorruptMode::Bits => data.len() * 8,
        };
        let n = self.amount(units);
        if n == 0 {
            return Some(data);
        }

        let mut out = data.to_vec();
        match self.options.mode {
            CorruptMode::Bytes => corrupt_bytes(&mut out, n, &mut self.rng),
            CorruptMode::Bits => corrupt_bits(&mut out, n, &mut self.rng),
        }
        Some(Bytes::from(out))
    }
}

/// Add a random non-zero value (mod 256) at `n` distinct byte positions.
pub fn corrupt_bytes<R: Rng + ?Sized>(data: &mut [u8], n: usize, rng: &mut R) {
    let n = n.min(data.len());
    for pos in index::sample(rng, data.len(), n).into_vec() {
        let delta: u8 = rng.gen_range(1..=255);
        data[pos] = data[pos].wrapping_add(delta);
    }
}

/// Flip `n` distinct bits.
pub fn corrupt_bits<R: Rng + ?Sized>(data: &mut [u8], n: usize, rng: &mut R) {
    let bits = data.len() * 8;
    let n = n.min(bits);
    for bit in index::sample(rng, bits, n).into_vec() {
        data[bit / 8] ^= 1 << (bit % 8);
    }
}
