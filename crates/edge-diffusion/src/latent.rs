//! Initial latent noise
//!
//! A generation starts from a `[1, 4, 64, 64]` standard-normal latent, either
//! drawn from a seeded generator or loaded from a file of little-endian `f32`
//! values.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;
use tracing::debug;

/// Latent shape for 512x512 SD 1.x generation
pub const LATENT_SHAPE: [usize; 4] = [1, 4, 64, 64];

/// Number of values in a latent
pub const LATENT_LEN: usize = 4 * 64 * 64;

#[derive(Error, Debug)]
pub enum LatentError {
    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Latent file must hold {expected} bytes (16384 f32 values), got {actual}")]
    Size { expected: usize, actual: usize },
}

/// Where the initial latent comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatentSource {
    /// Standard normal noise from a seeded ChaCha8 generator
    Seed(u64),
    /// Precomputed latent stored as packed little-endian `f32`
    File(PathBuf),
}

impl Default for LatentSource {
    fn default() -> Self {
        Self::Seed(0)
    }
}

impl LatentSource {
    /// Latent values in NCHW order
    pub fn values(&self) -> Result<Vec<f32>, LatentError> {
        match self {
            Self::Seed(seed) => Ok(seeded_noise(*seed)),
            Self::File(path) => read_latent_file(path),
        }
    }

    /// Create the `[1, 4, 64, 64]` latent tensor
    pub fn create<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>, LatentError> {
        let values = self.values()?;
        debug!(source = ?self, "Initial latent created");
        Ok(Tensor::from_data(TensorData::new(values, LATENT_SHAPE), device))
    }
}

/// Standard normal noise, reproducible for a given seed on every platform
pub fn seeded_noise(seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..LATENT_LEN).map(|_| StandardNormal.sample(&mut rng)).collect()
}

/// Read a latent stored as `LATENT_LEN` little-endian `f32` values
pub fn read_latent_file<P: AsRef<Path>>(path: P) -> Result<Vec<f32>, LatentError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| LatentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    latent_from_bytes(&bytes)
}

/// Decode packed little-endian `f32` values
pub fn latent_from_bytes(bytes: &[u8]) -> Result<Vec<f32>, LatentError> {
    let expected = LATENT_LEN * 4;
    if bytes.len() != expected {
        return Err(LatentError::Size {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
