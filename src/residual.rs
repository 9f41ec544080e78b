//! Residual vector quantization.
//!
//! Each stage quantizes what the previous stages could not represent:
//!
//! ```text
//! residual_0 = project_in(x)
//! q_i        = stage_i(residual_i)
//! residual_i+1 = residual_i - stop_grad(q_i)
//! output     = project_out(Σ q_i)
//! ```
//!
//! In training, quantizer dropout may stop the chain early; the skipped
//! stages report [`SENTINEL_INDEX`] and a zero loss so output shapes do not
//! depend on the sampled cutoff.

use std::sync::Arc;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::codebook::SharedCodebook;
use crate::config::ResidualVqConfig;
use crate::dist::{ProcessGroup, SingleProcess};
use crate::dropout::{DropoutPolicy, DropoutRng};
use crate::stage::{StageOptions, StageOutput, StageQuantizer, VectorQuantizer};
use crate::{Error, Result};

/// Index reported for a stage that did not run.
pub const SENTINEL_INDEX: i64 = -1;

/// Per-call options for [`ResidualVq::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Position mask shaped like the input without its feature axis.
    pub mask: Option<&'a Tensor>,
    /// Gumbel sampling temperature forwarded to every stage.
    pub temperature: Option<f64>,
    pub freeze_codebook: bool,
    /// Also return the per-stage code vectors.
    pub return_all_codes: bool,
    /// Fixed seed for the dropout cutoff.
    pub dropout_seed: Option<u64>,
    /// Training mode; enables quantizer dropout.
    pub train: bool,
}

/// Output of the index-discovery pass.
#[derive(Debug, Clone)]
pub struct ResidualVqOutput {
    /// Reconstruction in the input's layout and dimension.
    pub quantized: Tensor,
    /// `(batch, positions..., num_quantizers)` I64, `-1` for dropped stages.
    pub indices: Tensor,
    /// `(num_quantizers,)` per-stage losses, zero for dropped stages.
    pub losses: Tensor,
    /// Sum of stage outputs before `project_out`.
    pub quantized_sum: Tensor,
    /// Input after `project_in`.
    pub projected_input: Tensor,
    /// Mean codebook-diversity loss over the stages that ran.
    pub codebook_diversity_loss: Tensor,
    /// Mean commitment loss over the stages that ran.
    pub commitment_loss: Tensor,
    /// `(num_quantizers, batch, positions..., codebook_dim)` when requested.
    pub all_codes: Option<Tensor>,
}

/// Output of the pass driven by known indices.
#[derive(Debug, Clone)]
pub struct IndexLossOutput {
    pub quantized: Tensor,
    /// Cross-entropy summed over stages.
    pub loss: Tensor,
}

/// Indices of one stage, before they are stacked.
enum StageIndices {
    Active(Tensor),
    Dropped,
}

/// How the caller's tensor maps onto `(batch, positions, features)`.
#[derive(Debug, Clone)]
struct Layout {
    batch: usize,
    positions: Vec<usize>,
    image: bool,
}

impl Layout {
    fn num_positions(&self) -> usize {
        self.positions.iter().product()
    }

    /// `(batch, positions..., last)`
    fn shape_with(&self, last: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.positions.len() + 2);
        shape.push(self.batch);
        shape.extend_from_slice(&self.positions);
        shape.push(last);
        shape
    }

    /// Restore a `(batch, n, features)` tensor to the caller's layout.
    fn restore(&self, t: &Tensor) -> Result<Tensor> {
        let features = t.dim(D::Minus1)?;
        let t = t.reshape(self.shape_with(features))?;
        if self.image {
            Ok(t.permute((0, 3, 1, 2))?.contiguous()?)
        } else {
            Ok(t)
        }
    }
}

/// Residual vector quantizer over a chain of stages.
#[derive(Debug, Clone)]
pub struct ResidualVq<Q = VectorQuantizer> {
    stages: Vec<Q>,
    project_in: Option<Linear>,
    project_out: Option<Linear>,
    dropout: Option<DropoutPolicy>,
    process_group: Arc<dyn ProcessGroup>,
    cfg: ResidualVqConfig,
}

impl ResidualVq<VectorQuantizer> {
    /// Build a quantizer with Euclidean stages under `vb`
    /// (`layers.{i}._codebook.embed`, `project_in`, `project_out`).
    pub fn new(cfg: &ResidualVqConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let codebook_dim = cfg.codebook_dim();

        let mut stages = Vec::with_capacity(cfg.num_quantizers);
        let first = VectorQuantizer::new(codebook_dim, &cfg.stage, vb.pp("layers.0"))?;
        let shared = Arc::clone(first.codebook());
        stages.push(first);
        for i in 1..cfg.num_quantizers {
            let stage = if cfg.shared_codebook {
                VectorQuantizer::from_codebook(Arc::clone(&shared), &cfg.stage)
            } else {
                VectorQuantizer::new(codebook_dim, &cfg.stage, vb.pp(format!("layers.{i}")))?
            };
            stages.push(stage);
        }

        Self::with_stages(cfg, stages, vb)
    }
}

impl<Q: StageQuantizer> ResidualVq<Q> {
    /// Build a quantizer around caller-provided stages.
    pub fn with_stages(cfg: &ResidualVqConfig, mut stages: Vec<Q>, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        if stages.len() != cfg.num_quantizers {
            return Err(Error::Config(format!(
                "expected {} stages, got {}",
                cfg.num_quantizers,
                stages.len()
            )));
        }
        if stages.iter().any(|stage| stage.has_projections()) {
            return Err(Error::Config(
                "residual stages must not project their input".into(),
            ));
        }
        let codebook_dim = cfg.codebook_dim();
        if let Some(stage) = stages.iter().find(|s| s.codebook().dim() != codebook_dim) {
            return Err(Error::Config(format!(
                "stage codebook dim {} does not match codebook_dim {codebook_dim}",
                stage.codebook().dim()
            )));
        }

        if cfg.shared_codebook {
            let first = Arc::clone(stages[0].codebook());
            for stage in stages.iter_mut().skip(1) {
                stage.set_codebook(Arc::clone(&first));
            }
            tracing::debug!(stages = stages.len(), "sharing one codebook across all stages");
        }

        let (project_in, project_out) = if cfg.requires_projection() {
            (
                Some(candle_nn::linear(cfg.dim, codebook_dim, vb.pp("project_in"))?),
                Some(candle_nn::linear(codebook_dim, cfg.dim, vb.pp("project_out"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            stages,
            project_in,
            project_out,
            dropout: DropoutPolicy::from_config(cfg),
            process_group: Arc::new(SingleProcess),
            cfg: cfg.clone(),
        })
    }

    /// Use `group` to agree on dropout seeds across replicas.
    pub fn with_process_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.process_group = group;
        self
    }

    pub fn config(&self) -> &ResidualVqConfig {
        &self.cfg
    }

    pub fn num_quantizers(&self) -> usize {
        self.stages.len()
    }

    pub fn codebook_size(&self) -> usize {
        self.stages[0].codebook().size()
    }

    pub fn codebook_dim(&self) -> usize {
        self.stages[0].codebook().dim()
    }

    pub fn has_projections(&self) -> bool {
        self.project_in.is_some()
    }

    pub fn stages(&self) -> &[Q] {
        &self.stages
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut Q> {
        self.stages.get_mut(index)
    }

    /// Codebook handles, one per stage (aliases repeat).
    pub fn stage_codebooks(&self) -> Vec<SharedCodebook> {
        self.stages.iter().map(|s| Arc::clone(s.codebook())).collect()
    }

    /// All stage codebooks stacked: `(num_quantizers, codebook_size, codebook_dim)`.
    pub fn codebooks(&self) -> Result<Tensor> {
        let tables: Vec<Tensor> = self
            .stages
            .iter()
            .map(|s| s.codebook().embed().clone())
            .collect();
        Ok(Tensor::stack(&tables, 0)?)
    }

    fn project(proj: Option<&Linear>, x: &Tensor) -> Result<Tensor> {
        let Some(proj) = proj else {
            return Ok(x.clone());
        };
        let dims = x.dims().to_vec();
        let features = dims[dims.len() - 1];
        let rows = x.elem_count() / features;
        let y = proj.forward(&x.reshape((rows, features))?)?;
        let mut out_shape = dims;
        let last = out_shape.len() - 1;
        out_shape[last] = y.dim(1)?;
        Ok(y.reshape(out_shape)?)
    }

    /// Move the caller's tensor to `(batch, n, dim)`.
    fn to_sequence(&self, x: &Tensor) -> Result<(Tensor, Layout)> {
        let dims = x.dims();
        if self.cfg.accept_image_fmap {
            let (b, c, h, w) = x.dims4()?;
            if c != self.cfg.dim {
                return Err(Error::Contract(format!(
                    "feature map has {c} channels, expected {}",
                    self.cfg.dim
                )));
            }
            let seq = x.permute((0, 2, 3, 1))?.contiguous()?.reshape((b, h * w, c))?;
            let layout = Layout {
                batch: b,
                positions: vec![h, w],
                image: true,
            };
            return Ok((seq, layout));
        }

        if dims.len() < 3 {
            return Err(Error::Contract(format!(
                "expected (batch, positions..., dim), got shape {dims:?}"
            )));
        }
        let dim = dims[dims.len() - 1];
        if dim != self.cfg.dim {
            return Err(Error::Contract(format!(
                "input has dim {dim}, expected {}",
                self.cfg.dim
            )));
        }
        let layout = Layout {
            batch: dims[0],
            positions: dims[1..dims.len() - 1].to_vec(),
            image: false,
        };
        let seq = x.reshape((layout.batch, layout.num_positions(), dim))?;
        Ok((seq, layout))
    }

    fn flatten_mask(&self, mask: Option<&Tensor>, layout: &Layout) -> Result<Option<Tensor>> {
        let Some(mask) = mask else {
            return Ok(None);
        };
        let mut expected = vec![layout.batch];
        expected.extend_from_slice(&layout.positions);
        if mask.dims() != expected.as_slice() {
            return Err(Error::Contract(format!(
                "mask has shape {:?}, expected {expected:?}",
                mask.dims()
            )));
        }
        let mask = mask
            .to_dtype(DType::U8)?
            .reshape((layout.batch, layout.num_positions()))?;
        Ok(Some(mask))
    }

    /// Last stage index that runs this call, or `None` to run all stages.
    fn sample_cutoff(&self, fixed_seed: Option<u64>) -> Result<Option<usize>> {
        let Some(policy) = &self.dropout else {
            return Ok(None);
        };
        let mut rng = DropoutRng::select(fixed_seed, self.process_group.as_ref())?;
        let cutoff = rng.sample_cutoff(policy);
        tracing::debug!(
            cutoff,
            num_quantizers = self.stages.len(),
            "quantizer dropout"
        );
        Ok(Some(cutoff))
    }

    /// Quantize `x` and discover indices for every stage.
    ///
    /// `x` is `(batch, positions..., dim)`, or `(batch, dim, h, w)` when
    /// `accept_image_fmap` is set.
    pub fn forward(&self, x: &Tensor, opts: &ForwardOptions<'_>) -> Result<ResidualVqOutput> {
        let (seq, layout) = self.to_sequence(x)?;
        let mask = self.flatten_mask(opts.mask, &layout)?;
        let (batch, n) = (layout.batch, layout.num_positions());

        let projected = Self::project(self.project_in.as_ref(), &seq)?;
        let cutoff = if opts.train {
            self.sample_cutoff(opts.dropout_seed)?
        } else {
            None
        };

        let stage_opts = StageOptions {
            mask: mask.as_ref(),
            indices: None,
            temperature: opts.temperature,
            freeze_codebook: opts.freeze_codebook,
            train: opts.train,
        };

        let mut residual = projected.clone();
        let mut quantized_sum = projected.zeros_like()?;
        let mut stage_indices = Vec::with_capacity(self.stages.len());
        let mut losses = Vec::with_capacity(self.stages.len());
        let mut diversity = Vec::with_capacity(self.stages.len());
        let mut commitment = Vec::with_capacity(self.stages.len());

        for (i, stage) in self.stages.iter().enumerate() {
            if cutoff.is_some_and(|k| i > k) {
                stage_indices.push(StageIndices::Dropped);
                losses.push(Tensor::zeros((), x.dtype(), x.device())?);
                continue;
            }

            let StageOutput::Discovered {
                quantized,
                indices,
                loss,
                breakdown,
            } = stage.quantize(&residual, &stage_opts)?
            else {
                return Err(Error::Contract(format!(
                    "stage {i} returned a reconstruction loss without target indices"
                )));
            };
            tracing::trace!(stage = i, "quantized residual");

            residual = (residual - quantized.detach())?;
            quantized_sum = (quantized_sum + &quantized)?;

            stage_indices.push(StageIndices::Active(indices));
            losses.push(loss.to_dtype(x.dtype())?.reshape(())?);
            diversity.push(breakdown.codebook_diversity.reshape(())?);
            commitment.push(breakdown.commitment.reshape(())?);
        }

        let codebook_diversity_loss = mean_of(&diversity)?;
        let commitment_loss = mean_of(&commitment)?;

        let indices = stage_indices
            .into_iter()
            .map(|s| match s {
                StageIndices::Active(t) => Ok(t),
                StageIndices::Dropped => {
                    Tensor::full(SENTINEL_INDEX, (batch, n), x.device())
                }
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let indices = Tensor::stack(&indices, D::Minus1)?;
        let losses = Tensor::stack(&losses, 0)?;

        let output = Self::project(self.project_out.as_ref(), &quantized_sum)?;

        let all_codes = if opts.return_all_codes {
            let codes = self.codes_from_sequence_indices(&indices)?;
            let mut shape = vec![self.stages.len()];
            shape.extend(layout.shape_with(self.codebook_dim()));
            Some(codes.reshape(shape)?)
        } else {
            None
        };

        Ok(ResidualVqOutput {
            quantized: layout.restore(&output)?,
            indices: indices.reshape(layout.shape_with(self.stages.len()))?,
            losses,
            quantized_sum: layout.restore(&quantized_sum)?,
            projected_input: layout.restore(&projected)?,
            codebook_diversity_loss,
            commitment_loss,
            all_codes,
        })
    }

    /// Quantize `x` while scoring each stage against known `indices`
    /// (`(batch, positions..., num_quantizers)`). Dropout never applies.
    pub fn forward_with_indices(
        &self,
        x: &Tensor,
        indices: &Tensor,
        opts: &ForwardOptions<'_>,
    ) -> Result<IndexLossOutput> {
        if self.cfg.accept_image_fmap {
            return Err(Error::Contract(
                "target indices cannot be combined with image feature maps".into(),
            ));
        }
        let (seq, layout) = self.to_sequence(x)?;
        let mask = self.flatten_mask(opts.mask, &layout)?;
        let num_quantizers = self.stages.len();

        let expected = layout.shape_with(num_quantizers);
        if indices.dims() != expected.as_slice() {
            return Err(Error::Contract(format!(
                "indices have shape {:?}, expected {expected:?}",
                indices.dims()
            )));
        }
        let indices = indices
            .to_dtype(DType::I64)?
            .reshape((layout.batch, layout.num_positions(), num_quantizers))?;
        if count_equal(&indices, SENTINEL_INDEX)? > 0 {
            return Err(Error::Contract(
                "some of the residual vq indices were dropped out; use indices \
                 derived in eval mode to compute the cross entropy loss"
                    .into(),
            ));
        }

        let projected = Self::project(self.project_in.as_ref(), &seq)?;
        let mut residual = projected.clone();
        let mut quantized_sum = projected.zeros_like()?;
        let mut total_loss: Option<Tensor> = None;

        for (i, stage) in self.stages.iter().enumerate() {
            let stage_indices = indices.narrow(2, i, 1)?.squeeze(2)?.contiguous()?;
            let stage_opts = StageOptions {
                mask: mask.as_ref(),
                indices: Some(&stage_indices),
                temperature: opts.temperature,
                freeze_codebook: opts.freeze_codebook,
                train: opts.train,
            };
            let StageOutput::Reconstructed { quantized, loss } =
                stage.quantize(&residual, &stage_opts)?
            else {
                return Err(Error::Contract(format!(
                    "stage {i} ignored the supplied target indices"
                )));
            };

            residual = (residual - quantized.detach())?;
            quantized_sum = (quantized_sum + &quantized)?;
            total_loss = Some(match total_loss {
                Some(acc) => (acc + loss)?,
                None => loss,
            });
        }

        let output = Self::project(self.project_out.as_ref(), &quantized_sum)?;
        let loss = match total_loss {
            Some(loss) => loss,
            None => Tensor::zeros((), x.dtype(), x.device())?,
        };
        Ok(IndexLossOutput {
            quantized: layout.restore(&output)?,
            loss,
        })
    }

    /// Like [`forward_with_indices`](Self::forward_with_indices) with one
    /// `(batch, positions...)` index tensor per stage.
    pub fn forward_with_index_list(
        &self,
        x: &Tensor,
        indices: &[Tensor],
        opts: &ForwardOptions<'_>,
    ) -> Result<IndexLossOutput> {
        if indices.len() != self.stages.len() {
            return Err(Error::Contract(format!(
                "expected {} per-stage index tensors, got {}",
                self.stages.len(),
                indices.len()
            )));
        }
        let stacked = Tensor::stack(indices, D::Minus1)?;
        self.forward_with_indices(x, &stacked, opts)
    }

    /// Code vectors for `indices` shaped `(batch, positions..., q)`.
    ///
    /// `q` may be smaller than the number of stages when dropout is enabled;
    /// missing stages and `-1` entries yield zero vectors. Returns
    /// `(num_quantizers, batch, positions..., codebook_dim)`.
    pub fn get_codes_from_indices(&self, indices: &Tensor) -> Result<Tensor> {
        let dims = indices.dims();
        if dims.len() < 2 {
            return Err(Error::Contract(format!(
                "indices must be (batch, ..., num_quantizers), got shape {dims:?}"
            )));
        }
        let batch = dims[0];
        let stages = dims[dims.len() - 1];
        let positions = &dims[1..dims.len() - 1];
        let n: usize = positions.iter().product();

        let flat = indices.to_dtype(DType::I64)?.reshape((batch, n, stages))?;
        self.check_index_range(&flat)?;
        let codes = self.codes_from_sequence_indices(&flat)?;

        let mut shape = vec![self.stages.len(), batch];
        shape.extend_from_slice(positions);
        shape.push(self.codebook_dim());
        Ok(codes.reshape(shape)?)
    }

    /// Reject caller-supplied indices outside `[-1, codebook_size)`.
    fn check_index_range(&self, indices: &Tensor) -> Result<()> {
        if indices.elem_count() == 0 {
            return Ok(());
        }
        let size = self.codebook_size() as i64;
        let min = indices.min_all()?.to_scalar::<i64>()?;
        let max = indices.max_all()?.to_scalar::<i64>()?;
        if min < SENTINEL_INDEX || max >= size {
            return Err(Error::Contract(format!(
                "indices must lie in [0, {size}) or be {SENTINEL_INDEX}, found range [{min}, {max}]"
            )));
        }
        Ok(())
    }

    /// `(batch, n, q)` I64 indices to `(num_quantizers, batch, n, codebook_dim)`.
    /// Indices are trusted to be in range.
    fn codes_from_sequence_indices(&self, indices: &Tensor) -> Result<Tensor> {
        let (batch, n, given) = indices.dims3()?;
        let num_quantizers = self.stages.len();

        let indices = match given.cmp(&num_quantizers) {
            std::cmp::Ordering::Greater => {
                return Err(Error::Contract(format!(
                    "indices cover {given} stages but there are only {num_quantizers}"
                )));
            }
            std::cmp::Ordering::Less => {
                if !self.cfg.dropout_enabled() {
                    return Err(Error::Contract(
                        "quantize dropout must be enabled to reconstruct from \
                         indices with fewer stages than num_quantizers"
                            .into(),
                    ));
                }
                let pad = Tensor::full(
                    SENTINEL_INDEX,
                    (batch, n, num_quantizers - given),
                    indices.device(),
                )?;
                Tensor::cat(&[indices, &pad], 2)?
            }
            std::cmp::Ordering::Equal => indices.clone(),
        };

        let dropped = indices.eq(SENTINEL_INDEX)?;
        let safe = dropped.where_cond(&indices.zeros_like()?, &indices)?;

        let codes = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let ids = safe.narrow(2, i, 1)?.squeeze(2)?.contiguous()?;
                stage.codebook().lookup(&ids)
            })
            .collect::<Result<Vec<_>>>()?;
        let codes = Tensor::stack(&codes, 0)?;

        let dim = self.codebook_dim();
        let dropped = dropped
            .permute((2, 0, 1))?
            .unsqueeze(3)?
            .broadcast_as((num_quantizers, batch, n, dim))?;
        Ok(dropped.where_cond(&codes.zeros_like()?, &codes)?)
    }

    /// Decode `indices` back to the input space, never touching the encoder.
    pub fn get_output_from_indices(&self, indices: &Tensor) -> Result<Tensor> {
        let codes = self.get_codes_from_indices(indices)?;
        let mut summed = codes.get(0)?.zeros_like()?;
        for i in 0..codes.dim(0)? {
            summed = (summed + codes.get(i)?)?;
        }
        let output = Self::project(self.project_out.as_ref(), &summed)?;
        if self.cfg.accept_image_fmap {
            Ok(output.permute((0, 3, 1, 2))?.contiguous()?)
        } else {
            Ok(output)
        }
    }
}

/// Arithmetic mean of scalar tensors.
fn mean_of(values: &[Tensor]) -> Result<Tensor> {
    if values.is_empty() {
        return Err(Error::EmptyLossBreakdown);
    }
    Ok(Tensor::stack(values, 0)?.mean_all()?)
}

fn count_equal(t: &Tensor, value: i64) -> Result<u32> {
    Ok(t
        .eq(value)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::LocalProcessGroup;
    use crate::config::StageConfig;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn config() -> ResidualVqConfig {
        ResidualVqConfig {
            dim: 8,
            num_quantizers: 4,
            stage: StageConfig {
                codebook_size: 16,
                ..StageConfig::default()
            },
            ..ResidualVqConfig::default()
        }
    }

    fn build(cfg: &ResidualVqConfig) -> (ResidualVq, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (ResidualVq::new(cfg, vb.pp("rvq")).unwrap(), varmap)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    /// Number of leading stages that ran, per vector.
    fn active_stages(indices: &Tensor) -> Vec<usize> {
        let q = indices.dim(D::Minus1).unwrap();
        let rows = indices.reshape(((), q)).unwrap().to_vec2::<i64>().unwrap();
        rows.iter()
            .map(|row| row.iter().take_while(|&&i| i != SENTINEL_INDEX).count())
            .collect()
    }

    #[test]
    fn test_discovery_shapes_and_round_trip() {
        let (rvq, _vm) = build(&config());
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let out = rvq.forward(&x, &ForwardOptions::default()).unwrap();

        assert_eq!(out.indices.dims(), &[2, 5, 4]);
        assert_eq!(out.indices.dtype(), DType::I64);
        assert_eq!(out.losses.dims(), &[4]);
        assert_eq!(out.quantized.dims(), &[2, 5, 8]);
        for row in out.indices.reshape((10, 4)).unwrap().to_vec2::<i64>().unwrap() {
            assert!(row.iter().all(|&i| (0..16).contains(&i)), "row {row:?}");
        }

        let decoded = rvq.get_output_from_indices(&out.indices).unwrap();
        assert_eq!(max_abs_diff(&decoded, &out.quantized), 0.0);
    }

    #[test]
    fn test_codes_sum_to_quantized_sum() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            quantize_dropout_cutoff_index: 1,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        for seed in 0..5 {
            let opts = ForwardOptions {
                train: true,
                return_all_codes: true,
                dropout_seed: Some(seed),
                ..ForwardOptions::default()
            };
            let out = rvq.forward(&x, &opts).unwrap();
            let codes = out.all_codes.unwrap();
            assert_eq!(codes.dims(), &[4, 2, 5, 8]);
            let summed = codes.sum(0).unwrap();
            let diff = max_abs_diff(&summed, &out.quantized_sum);
            assert!(diff < 1e-5, "seed {seed}: diff = {diff}");
        }
    }

    #[test]
    fn test_dropout_fixed_seed_is_reproducible() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            quantize_dropout_cutoff_index: 1,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            train: true,
            return_all_codes: true,
            dropout_seed: Some(42),
            ..ForwardOptions::default()
        };

        let first = rvq.forward(&x, &opts).unwrap();
        let second = rvq.forward(&x, &opts).unwrap();
        let a = active_stages(&first.indices);
        let b = active_stages(&second.indices);
        assert_eq!(a, b);

        // Every vector shares the cutoff, and it respects the lower bound.
        let active = a[0];
        assert!(a.iter().all(|&k| k == active));
        assert!((2..=4).contains(&active), "active stages = {active}");

        // Dropped stages: sentinel indices, zero losses, zero codes.
        let indices = first.indices.reshape((10, 4)).unwrap().to_vec2::<i64>().unwrap();
        for row in &indices {
            assert!(row[active..].iter().all(|&i| i == SENTINEL_INDEX));
        }
        let losses = first.losses.to_vec1::<f32>().unwrap();
        assert!(losses[active..].iter().all(|&l| l == 0.0));
        let codes = first.all_codes.unwrap();
        for stage in active..4 {
            let norm: f32 = codes.get(stage).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(norm, 0.0);
        }
    }

    #[test]
    fn test_eval_ignores_dropout() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let out = rvq.forward(&x, &ForwardOptions::default()).unwrap();
        assert!(active_stages(&out.indices).iter().all(|&k| k == 4));
    }

    #[test]
    fn test_target_indices_ignore_dropout() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let found = rvq.forward(&x, &ForwardOptions::default()).unwrap();
        let eval = rvq
            .forward_with_indices(&x, &found.indices, &ForwardOptions::default())
            .unwrap();
        let eval_loss: f32 = eval.loss.to_scalar().unwrap();
        // Every stage contributed, so the decode of all indices is reproduced.
        assert_eq!(max_abs_diff(&eval.quantized, &found.quantized), 0.0);

        for seed in [0, 1, 42, 9999] {
            let opts = ForwardOptions {
                train: true,
                dropout_seed: Some(seed),
                ..ForwardOptions::default()
            };
            let out = rvq.forward_with_indices(&x, &found.indices, &opts).unwrap();
            let loss: f32 = out.loss.to_scalar().unwrap();
            assert_eq!(loss, eval_loss, "seed {seed}");
            assert_eq!(max_abs_diff(&out.quantized, &eval.quantized), 0.0);
        }
    }

    #[test]
    fn test_all_codes_match_codes_from_indices() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            train: true,
            dropout_seed: Some(7),
            return_all_codes: true,
            ..ForwardOptions::default()
        };
        let out = rvq.forward(&x, &opts).unwrap();
        let codes = rvq.get_codes_from_indices(&out.indices).unwrap();
        assert_eq!(max_abs_diff(&out.all_codes.unwrap(), &codes), 0.0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (rvq, _vm) = build(&config());
        for shape in [(0, 5, 8), (2, 0, 8)] {
            let x = Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap();
            let err = rvq.forward(&x, &ForwardOptions::default()).unwrap_err();
            assert!(matches!(err, Error::Contract(_)), "{err}");
        }
    }

    #[test]
    fn test_projection() {
        let cfg = ResidualVqConfig {
            codebook_dim: Some(4),
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        assert!(rvq.has_projections());
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let out = rvq.forward(&x, &ForwardOptions::default()).unwrap();
        assert_eq!(out.quantized.dims(), &[2, 5, 8]);
        assert_eq!(out.projected_input.dims(), &[2, 5, 4]);
        assert_eq!(out.quantized_sum.dims(), &[2, 5, 4]);
        assert_eq!(rvq.codebooks().unwrap().dims(), &[4, 16, 4]);

        let decoded = rvq.get_output_from_indices(&out.indices).unwrap();
        assert!(max_abs_diff(&decoded, &out.quantized) < 1e-6);
    }

    #[test]
    fn test_shared_codebook_aliasing() {
        let cfg = ResidualVqConfig {
            shared_codebook: true,
            ..config()
        };
        let (rvq, varmap) = build(&cfg);
        // Only one table exists.
        assert_eq!(varmap.all_vars().len(), 1);
        let codebooks = rvq.stage_codebooks();
        assert!(codebooks.iter().all(|cb| Arc::ptr_eq(cb, &codebooks[0])));
        assert_eq!(rvq.codebooks().unwrap().dims(), &[4, 16, 8]);

        let v = Tensor::full(3f32, 8, &Device::Cpu).unwrap();
        rvq.stages()[0].codebook().set_entry(5, &v).unwrap();
        let seen: Vec<f32> = rvq.stages()[3].codebook().embed().get(5).unwrap().to_vec1().unwrap();
        assert_eq!(seen, vec![3.0; 8]);

        let stacked = rvq.codebooks().unwrap();
        let row: Vec<f32> = stacked.get(2).unwrap().get(5).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![3.0; 8]);
    }

    #[test]
    fn test_cross_entropy_with_known_indices() {
        let (rvq, _vm) = build(&config());
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let found = rvq.forward(&x, &ForwardOptions::default()).unwrap();

        let out = rvq
            .forward_with_indices(&x, &found.indices, &ForwardOptions::default())
            .unwrap();
        assert_eq!(out.quantized.dims(), &[2, 5, 8]);
        let loss: f32 = out.loss.to_scalar().unwrap();
        assert!(loss.is_finite() && loss >= 0.0, "loss = {loss}");

        let per_stage: Vec<Tensor> = (0..4)
            .map(|i| found.indices.narrow(2, i, 1).unwrap().squeeze(2).unwrap())
            .collect();
        let listed = rvq
            .forward_with_index_list(&x, &per_stage, &ForwardOptions::default())
            .unwrap();
        let listed_loss: f32 = listed.loss.to_scalar().unwrap();
        assert_eq!(loss, listed_loss);
    }

    #[test]
    fn test_sentinel_targets_rejected() {
        let (rvq, _vm) = build(&config());
        let x = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let indices = Tensor::new(&[[[0i64, 1, -1, 2], [3, 4, 5, 6]]], &Device::Cpu).unwrap();
        let err = rvq
            .forward_with_indices(&x, &indices, &ForwardOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Contract(_)), "{err}");
    }

    #[test]
    fn test_coarse_indices_need_dropout() {
        let (rvq, _vm) = build(&config());
        let coarse = Tensor::zeros((2, 5, 2), DType::I64, &Device::Cpu).unwrap();
        assert!(rvq.get_codes_from_indices(&coarse).is_err());

        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let codes = rvq.get_codes_from_indices(&coarse).unwrap();
        assert_eq!(codes.dims(), &[4, 2, 5, 8]);
        for stage in 2..4 {
            let norm: f32 = codes.get(stage).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(norm, 0.0);
        }
        let first: Vec<f32> = codes.get(0).unwrap().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        let entry: Vec<f32> = rvq.stages()[0].codebook().embed().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(first, entry);
    }

    #[test]
    fn test_out_of_range_indices_rejected() {
        let (rvq, _vm) = build(&config());
        let indices = Tensor::full(16i64, (1, 2, 4), &Device::Cpu).unwrap();
        assert!(rvq.get_codes_from_indices(&indices).is_err());
    }

    #[test]
    fn test_image_feature_map() {
        let cfg = ResidualVqConfig {
            accept_image_fmap: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 8, 3, 4), &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            return_all_codes: true,
            ..ForwardOptions::default()
        };
        let out = rvq.forward(&x, &opts).unwrap();
        assert_eq!(out.quantized.dims(), &[2, 8, 3, 4]);
        assert_eq!(out.indices.dims(), &[2, 3, 4, 4]);
        assert_eq!(out.all_codes.unwrap().dims(), &[4, 2, 3, 4, 8]);

        let decoded = rvq.get_output_from_indices(&out.indices).unwrap();
        assert_eq!(max_abs_diff(&decoded, &out.quantized), 0.0);

        let err = rvq
            .forward_with_indices(&x, &out.indices, &ForwardOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
    }

    #[test]
    fn test_spatial_positions() {
        let (rvq, _vm) = build(&config());
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4, 8), &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 3, 4), DType::U8, &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            mask: Some(&mask),
            ..ForwardOptions::default()
        };
        let out = rvq.forward(&x, &opts).unwrap();
        assert_eq!(out.indices.dims(), &[2, 3, 4, 4]);
        assert_eq!(out.quantized.dims(), &[2, 3, 4, 8]);

        let bad_mask = Tensor::ones((2, 12), DType::U8, &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            mask: Some(&bad_mask),
            ..ForwardOptions::default()
        };
        assert!(rvq.forward(&x, &opts).is_err());
    }

    #[test]
    fn test_rejects_wrong_input_dim() {
        let (rvq, _vm) = build(&config());
        let x = Tensor::zeros((2, 5, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(rvq.forward(&x, &ForwardOptions::default()).is_err());
    }

    #[test]
    fn test_rejects_multi_head_config() {
        let cfg = ResidualVqConfig {
            heads: 2,
            ..config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(ResidualVq::new(&cfg, vb), Err(Error::Config(_))));
    }

    #[test]
    fn test_replicas_agree_on_dropout() {
        let cfg = ResidualVqConfig {
            quantize_dropout: true,
            ..config()
        };
        let (rvq, _vm) = build(&cfg);
        let world_size = 3;
        let group: Arc<dyn ProcessGroup> = Arc::new(LocalProcessGroup::new(world_size).unwrap());
        let rvq = rvq.with_process_group(group);

        let handles: Vec<_> = (0..world_size)
            .map(|_| {
                let rvq = rvq.clone();
                std::thread::spawn(move || {
                    let opts = ForwardOptions {
                        train: true,
                        ..ForwardOptions::default()
                    };
                    (0..10)
                        .map(|_| {
                            let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
                            active_stages(&rvq.forward(&x, &opts).unwrap().indices)[0]
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|r| r == &results[0]), "{results:?}");
    }
}
