//! edge-diffusion: on-device Stable Diffusion sampling
//!
//! Turns a text prompt into a 512x512 RGB image with Stable Diffusion 1.x:
//!
//! 1. CLIP tokenization ([`edge_diffusion_clip`])
//! 2. Text encoding, denoising and decoding through pluggable model
//!    [`session`]s
//! 3. PNDM scheduling with classifier-free guidance
//!    ([`edge_diffusion_samplers`])
//! 4. Conversion of the decoded tensor to pixels ([`image`])
//!
//! # Example
//!
//! ```ignore
//! use edge_diffusion::{CancellationToken, SampleConfig, StableDiffusion};
//! use edge_diffusion::backends::{DefaultBackend, default_device};
//!
//! let tokenizer = edge_diffusion::clip::ClipTokenizer::from_files("vocab.json", "merges.txt")?;
//! let pipeline = StableDiffusion::<DefaultBackend, _>::new(tokenizer, my_sessions, &default_device());
//!
//! let image = pipeline.text_to_image(
//!     "a photo of a cat",
//!     "",
//!     &SampleConfig::default(),
//!     |progress| println!("{:?}", progress.as_pair()),
//!     &CancellationToken::new(),
//! )?;
//! ```

pub mod backends;
pub mod image;
pub mod latent;
pub mod pipeline;
pub mod session;

pub use edge_diffusion_clip as clip;
pub use edge_diffusion_samplers as samplers;

pub use crate::image::{
    latent_to_preview, pixels_from_nchw, preview_to_pixels, tensor_to_pixels, ImageError,
};
pub use latent::{LatentError, LatentSource, LATENT_LEN, LATENT_SHAPE};
pub use pipeline::{
    CancellationToken, DebugConfig, Generation, PipelineError, Progress, SampleConfig,
    StableDiffusion,
};
pub use session::{
    BackendError, DecoderSession, DenoiserSession, ModelKind, ModelSessions, TextEncoderSession,
};
