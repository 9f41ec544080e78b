//! Single-stage vector quantizer.
//!
//! [`StageQuantizer`] is what the residual engine needs from one level of the
//! chain: quantize a `(batch, positions, dim)` batch against a codebook and
//! report losses. [`VectorQuantizer`] is the Euclidean nearest-neighbour
//! implementation used by default.

use candle_core::{D, DType, Tensor};
use candle_nn::VarBuilder;

use crate::codebook::{Codebook, SharedCodebook};
use crate::config::StageConfig;
use crate::{Error, Result};

/// Per-call options passed to a stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOptions<'a> {
    /// `(batch, positions)` U8 mask; 0 positions pass through unquantized.
    pub mask: Option<&'a Tensor>,
    /// `(batch, positions)` I64 target indices. Switches the stage to
    /// cross-entropy mode.
    pub indices: Option<&'a Tensor>,
    /// Gumbel sampling temperature, used in training when positive.
    pub temperature: Option<f64>,
    pub freeze_codebook: bool,
    pub train: bool,
}

/// Named components of a stage loss.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    pub commitment: Tensor,
    pub codebook_diversity: Tensor,
}

/// Result of quantizing one stage.
#[derive(Debug, Clone)]
pub enum StageOutput {
    /// Indices were chosen by the stage.
    Discovered {
        quantized: Tensor,
        /// `(batch, positions)` I64, never negative.
        indices: Tensor,
        loss: Tensor,
        breakdown: LossBreakdown,
    },
    /// Target indices were supplied; `loss` is their cross-entropy.
    Reconstructed { quantized: Tensor, loss: Tensor },
}

impl StageOutput {
    pub fn quantized(&self) -> &Tensor {
        match self {
            Self::Discovered { quantized, .. } | Self::Reconstructed { quantized, .. } => {
                quantized
            }
        }
    }
}

/// One level of a residual quantizer.
pub trait StageQuantizer {
    fn codebook(&self) -> &SharedCodebook;

    /// Point this stage at another codebook (aliasing, not copying).
    fn set_codebook(&mut self, codebook: SharedCodebook);

    /// Whether the stage projects its input internally. Residual stages must
    /// not, since the residual is taken in codebook space.
    fn has_projections(&self) -> bool {
        false
    }

    /// Quantize `x` of shape `(batch, positions, dim)`.
    fn quantize(&self, x: &Tensor, opts: &StageOptions<'_>) -> Result<StageOutput>;
}

/// Euclidean vector quantizer with commitment and diversity losses.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    codebook: SharedCodebook,
    cfg: StageConfig,
}

impl VectorQuantizer {
    pub fn new(dim: usize, cfg: &StageConfig, vb: VarBuilder) -> Result<Self> {
        let codebook = Codebook::new(cfg.codebook_size, dim, vb.pp("_codebook"))?;
        Ok(Self::from_codebook(codebook.shared(), cfg))
    }

    pub fn from_codebook(codebook: SharedCodebook, cfg: &StageConfig) -> Self {
        Self {
            codebook,
            cfg: cfg.clone(),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.cfg
    }

    /// Squared distances `(N, K)` between rows of `x` `(N, D)` and `embed`.
    fn distances(x: &Tensor, embed: &Tensor) -> Result<Tensor> {
        let x2 = x.sqr()?.sum_keepdim(1)?;
        let e2 = embed.sqr()?.sum(1)?.unsqueeze(0)?;
        let xe = (x.matmul(&embed.t()?)? * 2.0)?;
        Ok(x2.broadcast_add(&e2)?.broadcast_sub(&xe)?)
    }

    /// `argmax(logits / t + g)` with Gumbel noise `g`.
    fn gumbel_argmax(logits: &Tensor, temperature: f64) -> Result<Tensor> {
        let u = logits.rand_like(0.0, 1.0)?.clamp(1e-20, 1.0)?;
        let noise = u.log()?.neg()?.clamp(1e-20, f64::INFINITY)?.log()?.neg()?;
        Ok(((logits / temperature)? + noise)?.argmax(D::Minus1)?)
    }

    /// Update the codebook towards the mean of assigned inputs.
    fn ema_update(
        &self,
        x: &Tensor,
        ids: &Tensor,
        weights: &Tensor,
        decay: f64,
    ) -> Result<()> {
        let embed = self.codebook.embed();
        let (size, dim) = embed.dims2()?;
        let classes = Tensor::arange(0u32, size as u32, x.device())?.unsqueeze(0)?;
        let onehot = ids
            .unsqueeze(1)?
            .broadcast_eq(&classes)?
            .to_dtype(x.dtype())?
            .broadcast_mul(&weights.unsqueeze(1)?)?;

        let counts = onehot.sum(0)?;
        let sums = onehot.t()?.matmul(&x.detach())?;
        let means = sums.broadcast_div(&counts.clamp(1.0, f64::INFINITY)?.unsqueeze(1)?)?;
        let moved = ((embed * decay)? + (means * (1.0 - decay))?)?;

        let used = counts.gt(0.0)?.unsqueeze(1)?.broadcast_as((size, dim))?;
        let updated = used.where_cond(&moved, embed)?;
        self.codebook.replace(&updated.detach())
    }
}

/// Flattened per-position weights and their sum (at least 1).
fn position_weights(mask: Option<&Tensor>, like: &Tensor) -> Result<(Tensor, f64)> {
    let (b, n, _) = like.dims3()?;
    let weights = match mask {
        Some(mask) => {
            if mask.dims() != [b, n] {
                return Err(Error::Contract(format!(
                    "mask has shape {:?}, expected [{b}, {n}]",
                    mask.dims()
                )));
            }
            mask.to_dtype(like.dtype())?.flatten_all()?
        }
        None => Tensor::ones(b * n, like.dtype(), like.device())?,
    };
    let count = weights
        .sum_all()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?
        .max(1.0);
    Ok((weights, count))
}

/// Mean squared error over weighted positions, averaged over features.
fn masked_mse(a: &Tensor, b: &Tensor, weights: &Tensor, count: f64) -> Result<Tensor> {
    let dim = a.dim(D::Minus1)?;
    let per_position = (a - b)?.sqr()?.sum(D::Minus1)?.flatten_all()?;
    let total = (per_position * weights)?.sum_all()?;
    Ok((total / (count * dim as f64))?)
}

impl StageQuantizer for VectorQuantizer {
    fn codebook(&self) -> &SharedCodebook {
        &self.codebook
    }

    fn set_codebook(&mut self, codebook: SharedCodebook) {
        self.codebook = codebook;
    }

    fn quantize(&self, x: &Tensor, opts: &StageOptions<'_>) -> Result<StageOutput> {
        let (b, n, d) = x.dims3()?;
        if d != self.codebook.dim() {
            return Err(Error::Contract(format!(
                "stage input has dim {d}, codebook dim is {}",
                self.codebook.dim()
            )));
        }
        if b * n == 0 {
            return Err(Error::Contract(format!(
                "stage input has no positions to quantize (shape [{b}, {n}, {d}])"
            )));
        }

        let flat = x.reshape((b * n, d))?;
        let embed = if opts.freeze_codebook {
            self.codebook.embed().detach()
        } else {
            self.codebook.embed().clone()
        };
        let (weights, count) = position_weights(opts.mask, x)?;

        let dist = Self::distances(&flat.detach(), &embed)?;
        let ids = match opts.temperature {
            Some(t) if opts.train && t > 0.0 => Self::gumbel_argmax(&dist.neg()?, t)?,
            _ => dist.argmin(D::Minus1)?,
        };

        let quantize = embed.index_select(&ids, 0)?.reshape((b, n, d))?;

        // Value is exactly the codebook entry; the gradient reaches `x`.
        let straight_through = ((x - x.detach())? + quantize.detach())?;
        let quantized = match opts.mask {
            Some(mask) => mask
                .unsqueeze(2)?
                .broadcast_as((b, n, d))?
                .where_cond(&straight_through, x)?,
            None => straight_through,
        };

        if let Some(targets) = opts.indices {
            if targets.dims() != [b, n] {
                return Err(Error::Contract(format!(
                    "stage indices have shape {:?}, expected [{b}, {n}]",
                    targets.dims()
                )));
            }
            let targets = targets.to_dtype(DType::I64)?.reshape((b * n, 1))?;
            let log_probs = candle_nn::ops::log_softmax(&dist.neg()?, D::Minus1)?;
            let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
            let loss = ((picked * &weights)?.sum_all()?.neg()? / count)?;
            return Ok(StageOutput::Reconstructed { quantized, loss });
        }

        let commitment = masked_mse(x, &quantize.detach(), &weights, count)?;

        let probs = candle_nn::ops::softmax_last_dim(
            &(dist.neg()? * self.cfg.codebook_diversity_temperature)?,
        )?;
        let avg_probs = (probs.broadcast_mul(&weights.unsqueeze(1)?)?.sum(0)? / count)?;
        let entropy = (&avg_probs * avg_probs.clamp(1e-5, f64::INFINITY)?.log()?)?
            .sum_all()?
            .neg()?;
        let codebook_diversity = entropy.neg()?;

        let mut loss = ((&commitment * self.cfg.commitment_weight)?
            + (&codebook_diversity * self.cfg.codebook_diversity_weight)?)?;

        match self.cfg.ema_decay {
            Some(decay) if opts.train && !opts.freeze_codebook => {
                self.ema_update(&flat, &ids, &weights, decay)?;
            }
            None if !opts.freeze_codebook => {
                // Learnable codebook: pull entries towards their inputs.
                let codebook_loss = masked_mse(&quantize, &x.detach(), &weights, count)?;
                loss = (loss + codebook_loss)?;
            }
            _ => {}
        }

        let indices = ids.to_dtype(DType::I64)?.reshape((b, n))?;
        Ok(StageOutput::Discovered {
            quantized,
            indices,
            loss,
            breakdown: LossBreakdown {
                commitment,
                codebook_diversity,
            },
        })
    }
}
