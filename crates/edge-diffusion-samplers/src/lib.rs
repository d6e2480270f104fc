//! Noise scheduling for Stable Diffusion sampling
//!
//! - [`PndmScheduler`]: pseudo linear multistep scheduler with optional
//!   Runge-Kutta warm-up
//! - [`NoiseSchedule`]: beta / alpha tables shared by schedulers
//! - [`apply_guidance`]: classifier-free guidance combination

pub mod guidance;
pub mod pndm;
pub mod schedule;

pub use guidance::{apply_guidance, split_guidance_batch};
pub use pndm::{PndmScheduler, SchedulerError, SchedulerOutput, HISTORY_LEN};
pub use schedule::{
    spaced_timesteps, BetaSchedule, ConfigError, NoiseSchedule, PndmConfig, PredictionType,
    TimestepSpacing,
};
