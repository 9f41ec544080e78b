//! Quantizer dropout: how many residual stages run on a training call.
//!
//! A cutoff stage `k` is drawn from `[cutoff_index, num_quantizers)`; stages
//! after `k` are skipped and report the sentinel index. With structured
//! dropout (`multiple_of > 1`) the number of active stages `k + 1` is rounded
//! up to a multiple of `multiple_of`.
//!
//! The random source is picked once per call by [`DropoutRng::select`]:
//! a fixed seed wins, then a seed agreed across a multi-process group, then
//! the thread-local generator.

use rand::rngs::ThreadRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ResidualVqConfig;
use crate::dist::ProcessGroup;
use crate::Result;

/// Upper bound (exclusive) of the per-process seed contribution.
const SYNC_SEED_RANGE: u64 = 10_000;

fn round_up_multiple(num: usize, mult: usize) -> usize {
    num.div_ceil(mult) * mult
}

/// Range and granularity of the dropout cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropoutPolicy {
    cutoff_index: usize,
    multiple_of: usize,
    num_quantizers: usize,
}

impl DropoutPolicy {
    /// Policy for `cfg`, or `None` if dropout is disabled.
    pub fn from_config(cfg: &ResidualVqConfig) -> Option<Self> {
        cfg.dropout_enabled().then_some(Self {
            cutoff_index: cfg.quantize_dropout_cutoff_index,
            multiple_of: cfg.quantize_dropout_multiple_of.max(1),
            num_quantizers: cfg.num_quantizers,
        })
    }

    pub fn cutoff_index(&self) -> usize {
        self.cutoff_index
    }

    pub fn multiple_of(&self) -> usize {
        self.multiple_of
    }

    /// Draw the last stage index that runs this call.
    ///
    /// Rounding may point past the last stage; the result is clamped to
    /// `num_quantizers - 1`, which runs exactly the same stages.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let mut index = rng.random_range(self.cutoff_index..self.num_quantizers);
        if self.multiple_of != 1 {
            index = round_up_multiple(index + 1, self.multiple_of) - 1;
        }
        index.min(self.num_quantizers - 1)
    }
}

/// Random source for one forward call.
#[derive(Debug)]
pub enum DropoutRng {
    /// Caller supplied a seed.
    Seeded(ChaCha8Rng),
    /// Seed agreed across a process group.
    Synchronized(ChaCha8Rng),
    /// Unsynchronized thread-local generator.
    Local(ThreadRng),
}

impl DropoutRng {
    /// Pick the random source for this call.
    ///
    /// With more than one process and no fixed seed this performs exactly one
    /// collective reduction.
    pub fn select(fixed_seed: Option<u64>, group: &dyn ProcessGroup) -> Result<Self> {
        if let Some(seed) = fixed_seed {
            return Ok(Self::Seeded(ChaCha8Rng::seed_from_u64(seed)));
        }
        if group.world_size() > 1 {
            let local = rand::rng().random_range(0..SYNC_SEED_RANGE);
            let seed = group.all_reduce_sum(local)?;
            tracing::debug!(local, seed, "agreed quantizer dropout seed");
            return Ok(Self::Synchronized(ChaCha8Rng::seed_from_u64(seed)));
        }
        Ok(Self::Local(rand::rng()))
    }

    pub fn sample_cutoff(&mut self, policy: &DropoutPolicy) -> usize {
        match self {
            Self::Seeded(rng) | Self::Synchronized(rng) => policy.sample(rng),
            Self::Local(rng) => policy.sample(rng),
        }
    }
}
