//! Configuration for residual and grouped residual quantizers.
//!
//! Field names and defaults follow the usual `ResidualVQ` constructor
//! arguments so existing JSON configs deserialize without renaming.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Settings for a single quantization stage (one codebook).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of entries in the codebook.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Weight of the commitment term in the stage loss.
    #[serde(default = "default_commitment_weight")]
    pub commitment_weight: f64,

    /// Weight of the codebook-diversity term in the stage loss.
    #[serde(default)]
    pub codebook_diversity_weight: f64,

    /// Softmax temperature used when measuring codebook usage for the
    /// diversity loss.
    #[serde(default = "default_diversity_temperature")]
    pub codebook_diversity_temperature: f64,

    /// EMA decay for codebook updates in training. `None` leaves the
    /// codebook to the optimizer.
    #[serde(default)]
    pub ema_decay: Option<f64>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            codebook_size: default_codebook_size(),
            commitment_weight: default_commitment_weight(),
            codebook_diversity_weight: 0.0,
            codebook_diversity_temperature: default_diversity_temperature(),
            ema_decay: None,
        }
    }
}

/// Configuration of a [`ResidualVq`](crate::ResidualVq).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualVqConfig {
    /// Feature dimension of the input.
    pub dim: usize,

    /// Number of residual stages.
    pub num_quantizers: usize,

    /// Codebook dimension. When it differs from `dim`, linear projections
    /// are inserted around the residual loop.
    #[serde(default)]
    pub codebook_dim: Option<usize>,

    /// All stages alias the first stage's codebook.
    #[serde(default)]
    pub shared_codebook: bool,

    /// Codebook heads. Only 1 is supported by residual quantization.
    #[serde(default = "default_heads")]
    pub heads: usize,

    // --- Quantizer dropout ---
    #[serde(default)]
    pub quantize_dropout: bool,
    #[serde(default)]
    pub quantize_dropout_cutoff_index: usize,
    /// Structured dropout: the number of active stages is rounded up to a
    /// multiple of this value.
    #[serde(default = "default_multiple_of")]
    pub quantize_dropout_multiple_of: usize,

    /// Accept `(batch, dim, height, width)` feature maps instead of
    /// channel-last sequences.
    #[serde(default)]
    pub accept_image_fmap: bool,

    #[serde(default)]
    pub stage: StageConfig,
}

impl Default for ResidualVqConfig {
    fn default() -> Self {
        Self {
            dim: 256,
            num_quantizers: 8,
            codebook_dim: None,
            shared_codebook: false,
            heads: default_heads(),
            quantize_dropout: false,
            quantize_dropout_cutoff_index: 0,
            quantize_dropout_multiple_of: default_multiple_of(),
            accept_image_fmap: false,
            stage: StageConfig::default(),
        }
    }
}

impl ResidualVqConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Dimension the stages operate in.
    pub fn codebook_dim(&self) -> usize {
        self.codebook_dim.unwrap_or(self.dim)
    }

    /// Whether input/output projections are needed.
    pub fn requires_projection(&self) -> bool {
        self.codebook_dim() * self.heads != self.dim
    }

    /// Dropout only makes sense with more than one stage.
    pub fn dropout_enabled(&self) -> bool {
        self.quantize_dropout && self.num_quantizers > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.heads != 1 {
            return Err(Error::Config(format!(
                "residual vq is not compatible with multi-headed codes (heads = {})",
                self.heads
            )));
        }
        if self.num_quantizers == 0 {
            return Err(Error::Config("num_quantizers must be at least 1".into()));
        }
        if self.dim == 0 || self.codebook_dim() == 0 {
            return Err(Error::Config("dim and codebook_dim must be positive".into()));
        }
        if self.stage.codebook_size == 0 {
            return Err(Error::Config("codebook_size must be positive".into()));
        }
        if self.quantize_dropout_multiple_of == 0 {
            return Err(Error::Config(
                "quantize_dropout_multiple_of must be at least 1".into(),
            ));
        }
        if self.dropout_enabled() && self.quantize_dropout_cutoff_index >= self.num_quantizers {
            return Err(Error::Config(format!(
                "quantize_dropout_cutoff_index ({}) must be below num_quantizers ({})",
                self.quantize_dropout_cutoff_index, self.num_quantizers
            )));
        }
        if let Some(decay) = self.stage.ema_decay
            && !(0.0..1.0).contains(&decay)
        {
            return Err(Error::Config(format!("ema_decay must lie in [0, 1), got {decay}")));
        }
        Ok(())
    }
}

/// Configuration of a [`GroupedResidualVq`](crate::GroupedResidualVq).
///
/// `rvq.dim` is the full feature dimension; each group quantizes
/// `dim / groups` channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedResidualVqConfig {
    #[serde(default = "default_groups")]
    pub groups: usize,

    #[serde(flatten)]
    pub rvq: ResidualVqConfig,
}

impl Default for GroupedResidualVqConfig {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            rvq: ResidualVqConfig::default(),
        }
    }
}

impl GroupedResidualVqConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn dim_per_group(&self) -> usize {
        self.rvq.dim / self.groups.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 {
            return Err(Error::Config("groups must be at least 1".into()));
        }
        if self.rvq.dim % self.groups != 0 {
            return Err(Error::Config(format!(
                "dim ({}) must be divisible by groups ({})",
                self.rvq.dim, self.groups
            )));
        }
        self.group_config().validate()
    }

    /// Config for one group's residual quantizer.
    pub fn group_config(&self) -> ResidualVqConfig {
        ResidualVqConfig {
            dim: self.dim_per_group(),
            ..self.rvq.clone()
        }
    }
}

fn default_codebook_size() -> usize {
    1024
}

fn default_commitment_weight() -> f64 {
    1.0
}

fn default_diversity_temperature() -> f64 {
    100.0
}

fn default_heads() -> usize {
    1
}

fn default_multiple_of() -> usize {
    1
}

fn default_groups() -> usize {
    1
}
