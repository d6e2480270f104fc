//! Model backend sessions
//!
//! The text encoder, denoiser and decoder are external models (ONNX, TFLite,
//! a native burn module...). A [`ModelSessions`] provider opens one session
//! per model on demand; a session holds whatever the runtime needs and
//! releases it when dropped, so a generation never keeps more than the
//! model it is currently running resident.

use std::fmt;

use burn::prelude::*;
use burn::tensor::Int;
use thiserror::Error;

/// The three models of a Stable Diffusion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    TextEncoder,
    Denoiser,
    Decoder,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TextEncoder => "text encoder",
            Self::Denoiser => "denoiser",
            Self::Decoder => "decoder",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Model artifact for the {model} not found: {detail}")]
    NotFound { model: ModelKind, detail: String },

    #[error("{model} inference failed: {detail}")]
    Inference { model: ModelKind, detail: String },
}

/// CLIP text encoder
pub trait TextEncoderSession<B: Backend> {
    /// `[1, seq_len]` token ids to `[1, seq_len, hidden_dim]` embeddings
    fn encode(&mut self, input_ids: Tensor<B, 2, Int>) -> Result<Tensor<B, 3>, BackendError>;
}

/// Noise-predicting denoiser (UNet)
pub trait DenoiserSession<B: Backend> {
    /// Predict the noise in `sample` (`[2B, C, H, W]`) at `timestep`,
    /// conditioned on `encoder_hidden_states` (`[2, seq_len, hidden_dim]`).
    fn predict_noise(
        &mut self,
        sample: Tensor<B, 4>,
        timestep: i64,
        encoder_hidden_states: Tensor<B, 3>,
    ) -> Result<Tensor<B, 4>, BackendError>;
}

/// VAE decoder
pub trait DecoderSession<B: Backend> {
    /// `[1, C, H, W]` latent to `[1, C', H', W']` image in `[-1, 1]`
    fn decode(&mut self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, BackendError>;
}

/// Opens model sessions for a pipeline
///
/// Each call returns a fresh, owned session. Missing model artifacts are
/// reported as [`BackendError::NotFound`] before any inference happens.
pub trait ModelSessions<B: Backend> {
    type TextEncoder: TextEncoderSession<B>;
    type Denoiser: DenoiserSession<B>;
    type Decoder: DecoderSession<B>;

    fn open_text_encoder(&self) -> Result<Self::TextEncoder, BackendError>;

    fn open_denoiser(&self) -> Result<Self::Denoiser, BackendError>;

    fn open_decoder(&self) -> Result<Self::Decoder, BackendError>;
}
