//! Text-to-image sampling pipeline

mod sd1x;

pub use sd1x::StableDiffusion;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::prelude::*;
use edge_diffusion_clip::{TokenizerError, DEFAULT_MAX_LENGTH};
use edge_diffusion_samplers::{ConfigError, SchedulerError};
use thiserror::Error;

use crate::image::ImageError;
use crate::latent::{LatentError, LatentSource};
use crate::session::BackendError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Latent(#[from] LatentError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Unexpected {name} shape: expected {expected:?}, got {actual:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{name}: {nan_count}/{total} values are NaN, {inf_count}/{total} are Inf ({stats})")]
    NonFinite {
        name: String,
        nan_count: usize,
        inf_count: usize,
        total: usize,
        stats: String,
    },
}

/// Debug flags for pipeline and sampler diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugConfig {
    /// Log tensor statistics for latents and noise predictions
    pub sampler: bool,
    /// Fail on NaN/Inf values in denoiser output and latents
    pub nan: bool,
}

/// Configuration for sampling
#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Number of inference steps
    pub steps: usize,
    pub guidance_scale: f32,
    /// Latents are divided by this before decoding
    pub vae_scale_factor: f32,
    /// Token sequence length fed to the text encoder
    pub sequence_length: usize,
    /// Initial latent noise
    pub latent: LatentSource,
    /// Debug output flags
    pub debug: DebugConfig,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            guidance_scale: 7.5,
            vae_scale_factor: 0.18215,
            sequence_length: DEFAULT_MAX_LENGTH,
            latent: LatentSource::default(),
            debug: DebugConfig::default(),
        }
    }
}

/// Progress reported to the caller during generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// About to run denoising step `step` (1-based) of `total`
    Step {
        step: usize,
        total: usize,
        timestep: usize,
    },
    /// Sampling finished, the decoder is running
    Decoding,
}

impl Progress {
    /// `(step, total)`, or `(-1, -1)` while decoding
    pub fn as_pair(&self) -> (i64, i64) {
        match *self {
            Self::Step { step, total, .. } => (step as i64, total as i64),
            Self::Decoding => (-1, -1),
        }
    }
}

/// Cooperative cancellation flag shared with a running generation
///
/// Checked between denoising steps; a step already in progress finishes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a generation that can be cancelled
#[derive(Debug, Clone, PartialEq)]
pub enum Generation<T> {
    Completed(T),
    Cancelled,
}

impl<T> Generation<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Generation<U> {
        match self {
            Self::Completed(value) => Generation::Completed(f(value)),
            Self::Cancelled => Generation::Cancelled,
        }
    }
}

fn tensor_values<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Option<Vec<f32>> {
    tensor.clone().into_data().convert::<f32>().to_vec().ok()
}

/// Helper to compute tensor statistics for debugging
pub(crate) fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let Some(floats) = tensor_values(tensor) else {
        return "unreadable".to_string();
    };

    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;
    let std = var.sqrt();

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min, max, mean, std, nan_count, inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min, max, mean, std
        )
    }
}

/// Check tensor for NaN/Inf values when `enabled`
pub(crate) fn check_tensor_if<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: impl FnOnce() -> String,
    enabled: bool,
) -> Result<(), PipelineError> {
    if !enabled {
        return Ok(());
    }
    let Some(floats) = tensor_values(tensor) else {
        return Ok(());
    };

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();

    if nan_count > 0 || inf_count > 0 {
        return Err(PipelineError::NonFinite {
            name: name(),
            nan_count,
            inf_count,
            total: floats.len(),
            stats: tensor_stats(tensor),
        });
    }
    Ok(())
}

/// Fail with [`PipelineError::Shape`] unless `actual == expected`
pub(crate) fn check_shape(
    name: &'static str,
    expected: &[usize],
    actual: &[usize],
) -> Result<(), PipelineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PipelineError::Shape {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
