//! edge-diffusion CLI
//!
//! Inspection tools for the Stable Diffusion sampling stack: tokenize
//! prompts, print scheduler timesteps and preview initial latents.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use edge_diffusion::backends::{self, DefaultBackend};
use edge_diffusion::clip::{ClipTokenizer, EncodeOptions, Padding};
use edge_diffusion::samplers::{PndmConfig, PndmScheduler};
use edge_diffusion::{latent_to_preview, preview_to_pixels, LatentSource, SampleConfig};

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("enable the `ndarray` or `wgpu` feature");

#[derive(Parser)]
#[command(name = "edge-diffusion")]
#[command(about = "Stable Diffusion sampling tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tokenize a prompt with the CLIP BPE tokenizer
    Tokenize {
        /// Path to vocab.json
        #[arg(long)]
        vocab: PathBuf,

        /// Path to merges.txt
        #[arg(long)]
        merges: PathBuf,

        /// Text to tokenize
        #[arg(short, long)]
        prompt: String,

        /// Sequence length to pad to
        #[arg(long, default_value = "77")]
        max_length: usize,

        /// Keep every token instead of truncating to max_length
        #[arg(long)]
        no_truncate: bool,
    },

    /// Print the PNDM inference timestep sequence
    Timesteps {
        /// Number of inference steps
        #[arg(long, default_value = "20")]
        steps: usize,

        /// diffusers-style scheduler_config.json (defaults to SD 1.x)
        #[arg(long)]
        scheduler_config: Option<PathBuf>,
    },

    /// Write an RGB preview of an initial latent
    Preview {
        #[command(flatten)]
        latent: LatentArgs,

        /// Output image path
        #[arg(short, long, default_value = "preview.png")]
        output: PathBuf,
    },

    /// Show compiled backends and default settings
    Info,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct LatentArgs {
    /// Seed for the standard normal latent
    #[arg(long)]
    seed: Option<u64>,

    /// Latent file of 16384 little-endian f32 values
    #[arg(long)]
    latents: Option<PathBuf>,
}

impl LatentArgs {
    fn source(self) -> Result<LatentSource> {
        match (self.seed, self.latents) {
            (Some(seed), None) => Ok(LatentSource::Seed(seed)),
            (None, Some(path)) => Ok(LatentSource::File(path)),
            _ => bail!("pass exactly one of --seed or --latents"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // Fails only if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Tokenize {
            vocab,
            merges,
            prompt,
            max_length,
            no_truncate,
        } => {
            let tokenizer = ClipTokenizer::from_files(&vocab, &merges)
                .context("Failed to load tokenizer files")?;
            info!(vocab_size = tokenizer.vocab_size(), "Tokenizer loaded");

            let options = EncodeOptions {
                max_length,
                truncation: !no_truncate,
                padding: Padding::MaxLength,
            };
            let batch = tokenizer
                .encode_batch_with(&[prompt.as_str()], &options)
                .context("Failed to tokenize prompt")?;

            println!("input_ids:      {:?}", batch.input_ids[0]);
            println!("attention_mask: {:?}", batch.attention_mask[0]);
        }

        Commands::Timesteps {
            steps,
            scheduler_config,
        } => {
            let config = match scheduler_config {
                Some(path) => PndmConfig::from_file(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => PndmConfig::default(),
            };
            let mut scheduler = PndmScheduler::<DefaultBackend>::new(config)
                .context("Invalid scheduler config")?;
            scheduler.set_timesteps(steps)?;

            let timesteps = scheduler.timesteps();
            println!("{} timesteps:", timesteps.len());
            println!("{:?}", timesteps);
        }

        Commands::Preview { latent, output } => {
            let source = latent.source()?;
            let device = backends::default_device();
            let latent = source
                .create::<DefaultBackend>(&device)
                .context("Failed to create latent")?;

            let preview = latent_to_preview(latent)?;
            let image = preview_to_pixels(preview)?;
            image
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(path = %output.display(), "Preview written");
        }

        Commands::Info => {
            let sample = SampleConfig::default();
            let scheduler = PndmConfig::default();

            println!("edge-diffusion {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Backends: {}", backends::enabled_backends().join(", "));
            println!();
            println!("Sampling defaults:");
            println!("  Steps:            {}", sample.steps);
            println!("  Guidance scale:   {}", sample.guidance_scale);
            println!("  VAE scale factor: {}", sample.vae_scale_factor);
            println!("  Sequence length:  {}", sample.sequence_length);
            println!();
            println!("Scheduler (PNDM):");
            println!("  Train timesteps:  {}", scheduler.num_train_timesteps);
            println!(
                "  Betas:            {:?} {} -> {}",
                scheduler.beta_schedule, scheduler.beta_start, scheduler.beta_end
            );
            println!("  Spacing:          {}", scheduler.timestep_spacing);
            println!("  Steps offset:     {}", scheduler.steps_offset);
            println!("  Skip PRK steps:   {}", scheduler.skip_prk_steps);
            println!("  Prediction type:  {:?}", scheduler.prediction_type);
        }
    }

    Ok(())
}
