//! Codebook storage shared between quantization stages.
//!
//! A codebook is a `(codebook_size, codebook_dim)` table held in a
//! [`Var`], so updates happen in place. Stages hold it through
//! [`SharedCodebook`]; cloning the `Arc` aliases the same storage, which is
//! how `shared_codebook` makes every residual stage read and write one table.

use std::sync::Arc;

use candle_core::{Tensor, Var};
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

/// Reference-counted handle to a [`Codebook`].
pub type SharedCodebook = Arc<Codebook>;

/// A table of `size` code vectors of width `dim`.
#[derive(Debug)]
pub struct Codebook {
    embed: Var,
    size: usize,
    dim: usize,
}

impl Codebook {
    /// Create (or load) the `embed` table under `vb`.
    pub fn new(size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let embed = vb.get_with_hints(
            (size, dim),
            "embed",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Self::from_tensor(&embed)
    }

    /// Wrap an existing `(size, dim)` tensor. If the tensor is already a
    /// variable (e.g. from a `VarMap`), its storage is reused.
    pub fn from_tensor(embed: &Tensor) -> Result<Self> {
        let (size, dim) = embed.dims2()?;
        Ok(Self {
            embed: Var::from_tensor(embed)?,
            size,
            dim,
        })
    }

    pub fn shared(self) -> SharedCodebook {
        Arc::new(self)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Live view of the table: `(size, dim)`.
    pub fn embed(&self) -> &Tensor {
        self.embed.as_tensor()
    }

    /// The underlying variable, for optimizers.
    pub fn var(&self) -> &Var {
        &self.embed
    }

    /// Gather code vectors for an index tensor of any shape.
    ///
    /// Output shape is `indices.dims() ++ [dim]`. Indices must be in range.
    pub fn lookup(&self, indices: &Tensor) -> Result<Tensor> {
        let mut shape = indices.dims().to_vec();
        let flat = indices.flatten_all()?;
        let codes = self.embed().index_select(&flat, 0)?;
        shape.push(self.dim);
        Ok(codes.reshape(shape)?)
    }

    /// Overwrite entry `index` with `vector` (shape `(dim,)`).
    pub fn set_entry(&self, index: usize, vector: &Tensor) -> Result<()> {
        if index >= self.size {
            return Err(Error::Contract(format!(
                "codebook entry {index} out of range for size {}",
                self.size
            )));
        }
        let row = vector
            .to_dtype(self.embed.dtype())?
            .reshape((1, self.dim))?;
        let updated = self
            .embed()
            .slice_assign(&[index..index + 1, 0..self.dim], &row)?;
        self.embed.set(&updated)?;
        Ok(())
    }

    /// Replace the whole table in place.
    pub fn replace(&self, embed: &Tensor) -> Result<()> {
        if embed.dims() != [self.size, self.dim] {
            return Err(Error::Contract(format!(
                "replacement codebook has shape {:?}, expected [{}, {}]",
                embed.dims(),
                self.size,
                self.dim
            )));
        }
        self.embed.set(&embed.to_dtype(self.embed.dtype())?)?;
        Ok(())
    }
}
