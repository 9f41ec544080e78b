//! Grouped residual vector quantization.
//!
//! The feature axis is split into `groups` equal contiguous slices and each
//! slice gets its own [`ResidualVq`]. Reconstructions are concatenated back
//! along the split axis; per-group indices and losses are stacked on a new
//! leading group axis.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::Rng;

use crate::config::GroupedResidualVqConfig;
use crate::residual::{ForwardOptions, IndexLossOutput, ResidualVq, ResidualVqOutput};
use crate::stage::{StageQuantizer, VectorQuantizer};
use crate::{Error, Result};

/// Upper bound (inclusive) of the per-call dropout seed shared by the groups.
const MAX_GROUP_SEED: u64 = 10_000_000;

/// Output of [`GroupedResidualVq::forward`].
#[derive(Debug, Clone)]
pub struct GroupedResidualVqOutput {
    /// Reconstruction, groups concatenated along the split axis.
    pub quantized: Tensor,
    /// `(groups, batch, positions..., num_quantizers)`
    pub indices: Tensor,
    /// `(groups, num_quantizers)`
    pub losses: Tensor,
    pub quantized_sum: Tensor,
    pub projected_input: Tensor,
    /// `(groups,)`
    pub codebook_diversity_loss: Tensor,
    /// `(groups,)`
    pub commitment_loss: Tensor,
    /// `(groups, num_quantizers, batch, positions..., codebook_dim)`
    pub all_codes: Option<Tensor>,
}

/// Independent residual quantizers over slices of the feature axis.
#[derive(Debug, Clone)]
pub struct GroupedResidualVq<Q = VectorQuantizer> {
    rvqs: Vec<ResidualVq<Q>>,
    dim: usize,
    accept_image_fmap: bool,
}

impl GroupedResidualVq<VectorQuantizer> {
    /// Build `groups` quantizers under `rvqs.{i}`.
    pub fn new(cfg: &GroupedResidualVqConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let group_cfg = cfg.group_config();
        let rvqs = (0..cfg.groups)
            .map(|i| ResidualVq::new(&group_cfg, vb.pp(format!("rvqs.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Self::from_groups(cfg, rvqs)
    }
}

impl<Q: StageQuantizer> GroupedResidualVq<Q> {
    /// Assemble from already-built per-group quantizers.
    pub fn from_groups(cfg: &GroupedResidualVqConfig, rvqs: Vec<ResidualVq<Q>>) -> Result<Self> {
        cfg.validate()?;
        if rvqs.len() != cfg.groups {
            return Err(Error::Config(format!(
                "expected {} group quantizers, got {}",
                cfg.groups,
                rvqs.len()
            )));
        }
        let dim_per_group = cfg.dim_per_group();
        if rvqs.iter().any(|rvq| rvq.config().dim != dim_per_group) {
            return Err(Error::Config(format!(
                "every group quantizer must take dim {dim_per_group}"
            )));
        }
        if rvqs
            .iter()
            .any(|rvq| rvq.config().accept_image_fmap != cfg.rvq.accept_image_fmap)
        {
            return Err(Error::Config(
                "group quantizers disagree on accept_image_fmap".into(),
            ));
        }
        Ok(Self {
            rvqs,
            dim: cfg.rvq.dim,
            accept_image_fmap: cfg.rvq.accept_image_fmap,
        })
    }

    pub fn groups(&self) -> usize {
        self.rvqs.len()
    }

    pub fn rvqs(&self) -> &[ResidualVq<Q>] {
        &self.rvqs
    }

    /// Axis the features are split along for a tensor of rank `rank`:
    /// channels (1) for image maps, otherwise the last axis.
    pub fn split_axis(&self, rank: usize) -> usize {
        if self.accept_image_fmap {
            1
        } else {
            rank.saturating_sub(1)
        }
    }

    /// `(groups, num_quantizers, codebook_size, codebook_dim)`
    pub fn codebooks(&self) -> Result<Tensor> {
        let tables = self
            .rvqs
            .iter()
            .map(|rvq| rvq.codebooks())
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tables, 0)?)
    }

    fn split(&self, x: &Tensor) -> Result<(Vec<Tensor>, usize)> {
        let axis = self.split_axis(x.rank());
        let features = x.dim(axis)?;
        if features != self.dim {
            return Err(Error::Contract(format!(
                "split axis {axis} has size {features}, expected {}",
                self.dim
            )));
        }
        let chunks = x
            .chunk(self.rvqs.len(), axis)?
            .into_iter()
            .map(|c| c.contiguous())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((chunks, axis))
    }

    /// Quantize every group with one shared dropout seed.
    ///
    /// The seed is `opts.dropout_seed`, or drawn fresh for this call.
    pub fn forward(
        &self,
        x: &Tensor,
        opts: &ForwardOptions<'_>,
    ) -> Result<GroupedResidualVqOutput> {
        let (chunks, axis) = self.split(x)?;
        let seed = opts
            .dropout_seed
            .unwrap_or_else(|| rand::rng().random_range(0..=MAX_GROUP_SEED));
        let group_opts = ForwardOptions {
            dropout_seed: Some(seed),
            ..*opts
        };

        let outs = self
            .rvqs
            .iter()
            .zip(&chunks)
            .map(|(rvq, chunk)| rvq.forward(chunk, &group_opts))
            .collect::<Result<Vec<_>>>()?;

        let all_codes = if opts.return_all_codes {
            let codes = outs
                .iter()
                .map(|o| {
                    o.all_codes
                        .clone()
                        .ok_or_else(|| Error::Contract("group did not return codes".into()))
                })
                .collect::<Result<Vec<_>>>()?;
            Some(Tensor::stack(&codes, 0)?)
        } else {
            None
        };

        Ok(GroupedResidualVqOutput {
            quantized: Tensor::cat(&pick(&outs, |o| &o.quantized), axis)?,
            indices: Tensor::stack(&pick(&outs, |o| &o.indices), 0)?,
            losses: Tensor::stack(&pick(&outs, |o| &o.losses), 0)?,
            quantized_sum: Tensor::cat(&pick(&outs, |o| &o.quantized_sum), axis)?,
            projected_input: Tensor::cat(&pick(&outs, |o| &o.projected_input), axis)?,
            codebook_diversity_loss: Tensor::stack(
                &pick(&outs, |o| &o.codebook_diversity_loss),
                0,
            )?,
            commitment_loss: Tensor::stack(&pick(&outs, |o| &o.commitment_loss), 0)?,
            all_codes,
        })
    }

    /// Score each group against its own `(batch, positions..., q)` indices.
    /// Losses are summed over groups.
    ///
    /// Exactly one index set per group is required; with no index sets use
    /// [`forward`](Self::forward) instead.
    pub fn forward_with_indices(
        &self,
        x: &Tensor,
        indices: &[Tensor],
        opts: &ForwardOptions<'_>,
    ) -> Result<IndexLossOutput> {
        self.check_group_count(indices.len())?;
        let (chunks, axis) = self.split(x)?;

        let mut quantized = Vec::with_capacity(self.rvqs.len());
        let mut loss: Option<Tensor> = None;
        for ((rvq, chunk), group_indices) in self.rvqs.iter().zip(&chunks).zip(indices) {
            let out = rvq.forward_with_indices(chunk, group_indices, opts)?;
            quantized.push(out.quantized);
            loss = Some(match loss {
                Some(acc) => (acc + out.loss)?,
                None => out.loss,
            });
        }

        let loss = match loss {
            Some(loss) => loss,
            None => Tensor::zeros((), x.dtype(), x.device())?,
        };
        Ok(IndexLossOutput {
            quantized: Tensor::cat(&quantized, axis)?,
            loss,
        })
    }

    /// `(groups, num_quantizers, batch, positions..., codebook_dim)`
    pub fn get_codes_from_indices(&self, indices: &[Tensor]) -> Result<Tensor> {
        self.check_group_count(indices.len())?;
        let codes = self
            .rvqs
            .iter()
            .zip(indices)
            .map(|(rvq, group_indices)| rvq.get_codes_from_indices(group_indices))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&codes, 0)?)
    }

    /// Decode per-group indices and concatenate along the split axis.
    pub fn get_output_from_indices(&self, indices: &[Tensor]) -> Result<Tensor> {
        self.check_group_count(indices.len())?;
        let outputs = self
            .rvqs
            .iter()
            .zip(indices)
            .map(|(rvq, group_indices)| rvq.get_output_from_indices(group_indices))
            .collect::<Result<Vec<_>>>()?;
        let axis = self.split_axis(outputs[0].rank());
        Ok(Tensor::cat(&outputs, axis)?)
    }

    fn check_group_count(&self, got: usize) -> Result<()> {
        if got != self.rvqs.len() {
            return Err(Error::GroupMismatch {
                expected: self.rvqs.len(),
                got,
            });
        }
        Ok(())
    }
}

fn pick(outs: &[ResidualVqOutput], field: impl Fn(&ResidualVqOutput) -> &Tensor) -> Vec<Tensor> {
    outs.iter().map(|o| field(o).clone()).collect()
}
