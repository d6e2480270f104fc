//! Stable Diffusion 1.x text-to-image pipeline

use burn::prelude::*;
use burn::tensor::Int;
use image::RgbImage;
use tracing::{debug, info};

use edge_diffusion_clip::ClipTokenizer;
use edge_diffusion_samplers::{apply_guidance, split_guidance_batch, PndmConfig, PndmScheduler};

use super::{
    check_shape, check_tensor_if, tensor_stats, CancellationToken, Generation, PipelineError,
    Progress, SampleConfig,
};
use crate::image::tensor_to_pixels;
use crate::latent::LATENT_SHAPE;
use crate::session::{DecoderSession, DenoiserSession, ModelSessions, TextEncoderSession};

/// Stable Diffusion 1.x pipeline
///
/// Owns the tokenizer and scheduler configuration; the three models are
/// opened through `M` only for the phase that needs them.
pub struct StableDiffusion<B: Backend, M: ModelSessions<B>> {
    pub tokenizer: ClipTokenizer,
    pub scheduler_config: PndmConfig,
    pub sessions: M,
    pub device: B::Device,
}

impl<B: Backend, M: ModelSessions<B>> StableDiffusion<B, M> {
    /// Create a pipeline with the default PNDM scheduler config
    pub fn new(tokenizer: ClipTokenizer, sessions: M, device: &B::Device) -> Self {
        Self {
            tokenizer,
            scheduler_config: PndmConfig::default(),
            sessions,
            device: device.clone(),
        }
    }

    /// Use a custom scheduler config
    pub fn with_scheduler_config(mut self, config: PndmConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    fn token_tensor(&self, ids: &[u32]) -> Tensor<B, 2, Int> {
        let data: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        Tensor::from_data(TensorData::new(data, [1, ids.len()]), &self.device)
    }

    /// Encode prompt and negative prompt into `[2, seq_len, hidden_dim]`
    /// embeddings, unconditional first.
    pub fn encode_prompt(
        &self,
        prompt: &str,
        negative_prompt: &str,
        config: &SampleConfig,
    ) -> Result<Tensor<B, 3>, PipelineError> {
        self.tokenizer.clear_cache();
        let batch =
            self.tokenizer
                .encode_batch(&[prompt, negative_prompt], config.sequence_length, true)?;
        debug!(
            prompt_tokens = batch.input_ids[0].len(),
            negative_tokens = batch.input_ids[1].len(),
            "Prompts tokenized"
        );

        let mut encoder = self.sessions.open_text_encoder()?;
        let cond = encoder.encode(self.token_tensor(&batch.input_ids[0]))?;
        let uncond = encoder.encode(self.token_tensor(&batch.input_ids[1]))?;

        let [batch_size, _, _] = cond.dims();
        check_shape("text embedding batch", &[1], &[batch_size])?;
        check_shape("negative text embedding", &cond.dims(), &uncond.dims())?;

        info!(shape = ?cond.dims(), "Prompt encoded");
        Ok(Tensor::cat(vec![uncond, cond], 0))
    }

    /// Run the guided denoising loop from `latent`
    ///
    /// `progress` is called before every step. The loop stops with
    /// [`Generation::Cancelled`] when `cancel` is set between steps.
    pub fn sample_latent<F>(
        &self,
        embeddings: Tensor<B, 3>,
        latent: Tensor<B, 4>,
        config: &SampleConfig,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<Generation<Tensor<B, 4>>, PipelineError>
    where
        F: FnMut(Progress),
    {
        let debug_sampler = config.debug.sampler;
        let debug_nan = config.debug.nan;

        check_shape("latent", &LATENT_SHAPE, &latent.dims())?;
        let [text_batch, _, _] = embeddings.dims();
        check_shape("text embedding batch", &[2], &[text_batch])?;

        let mut scheduler = PndmScheduler::<B>::new(self.scheduler_config.clone())?;
        scheduler.set_timesteps(config.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();

        let mut denoiser = self.sessions.open_denoiser()?;
        info!(steps = total, guidance_scale = config.guidance_scale, "Sampling");

        if debug_sampler {
            debug!(stats = %tensor_stats(&latent), "Initial latent");
            debug!(timesteps = ?timesteps, "Timesteps");
        }

        let [_, c, h, w] = latent.dims();
        let mut latent = latent * scheduler.init_noise_sigma();

        for (step_idx, &t) in timesteps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(step = step_idx, "Sampling cancelled");
                return Ok(Generation::Cancelled);
            }
            progress(Progress::Step {
                step: step_idx + 1,
                total,
                timestep: t,
            });

            // Unconditional and conditional copies share one denoiser call
            let model_input = Tensor::cat(vec![latent.clone(), latent.clone()], 0);
            let noise_pred = denoiser.predict_noise(model_input, t as i64, embeddings.clone())?;
            check_shape("noise prediction", &[2, c, h, w], &noise_pred.dims())?;
            check_tensor_if(
                &noise_pred,
                || format!("step_{}_noise_pred", step_idx),
                debug_nan,
            )?;

            let (noise_uncond, noise_cond) =
                split_guidance_batch(noise_pred).ok_or(PipelineError::Shape {
                    name: "noise prediction batch",
                    expected: vec![2],
                    actual: vec![],
                })?;

            if debug_sampler && step_idx < 3 {
                debug!(
                    step = step_idx,
                    uncond = %tensor_stats(&noise_uncond),
                    cond = %tensor_stats(&noise_cond),
                    "Noise prediction"
                );
            }

            let noise_pred = apply_guidance(noise_uncond, noise_cond, config.guidance_scale);
            latent = scheduler.step(noise_pred, t, latent)?;
            check_tensor_if(&latent, || format!("step_{}_latent", step_idx), debug_nan)?;

            if debug_sampler && step_idx < 3 {
                debug!(step = step_idx, stats = %tensor_stats(&latent), "Latent");
            }
        }

        if debug_sampler {
            debug!(stats = %tensor_stats(&latent), "Final latent");
        }

        Ok(Generation::Completed(latent))
    }

    /// Decode a final latent to a `[1, C, H, W]` image tensor in `[-1, 1]`
    pub fn decode<F>(
        &self,
        latent: Tensor<B, 4>,
        config: &SampleConfig,
        mut progress: F,
    ) -> Result<Tensor<B, 4>, PipelineError>
    where
        F: FnMut(Progress),
    {
        progress(Progress::Decoding);
        check_tensor_if(&latent, || "vae_input_latent".to_string(), config.debug.nan)?;

        let latent = latent * (1.0 / config.vae_scale_factor);
        let mut decoder = self.sessions.open_decoder()?;
        let image = decoder.decode(latent)?;

        let [batch, _, _, _] = image.dims();
        check_shape("decoded image batch", &[1], &[batch])?;
        check_tensor_if(&image, || "vae_output".to_string(), config.debug.nan)?;

        if config.debug.sampler {
            debug!(stats = %tensor_stats(&image), "Decoder output");
        }
        info!(shape = ?image.dims(), "Latent decoded");
        Ok(image)
    }

    /// Sample from `latent` and decode the result
    pub fn generate<F>(
        &self,
        embeddings: Tensor<B, 3>,
        latent: Tensor<B, 4>,
        config: &SampleConfig,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<Generation<Tensor<B, 4>>, PipelineError>
    where
        F: FnMut(Progress),
    {
        let latent = match self.sample_latent(embeddings, latent, config, &mut progress, cancel)? {
            Generation::Completed(latent) => latent,
            Generation::Cancelled => return Ok(Generation::Cancelled),
        };
        if cancel.is_cancelled() {
            return Ok(Generation::Cancelled);
        }
        self.decode(latent, config, progress).map(Generation::Completed)
    }

    /// Full pipeline: prompt -> image
    ///
    /// Either returns a complete image or nothing; no partial output
    /// survives an error or cancellation.
    pub fn text_to_image<F>(
        &self,
        prompt: &str,
        negative_prompt: &str,
        config: &SampleConfig,
        progress: F,
        cancel: &CancellationToken,
    ) -> Result<Generation<RgbImage>, PipelineError>
    where
        F: FnMut(Progress),
    {
        let embeddings = self.encode_prompt(prompt, negative_prompt, config)?;
        let latent = config.latent.create::<B>(&self.device)?;

        match self.generate(embeddings, latent, config, progress, cancel)? {
            Generation::Completed(image) => Ok(Generation::Completed(tensor_to_pixels(image)?)),
            Generation::Cancelled => Ok(Generation::Cancelled),
        }
    }
}
