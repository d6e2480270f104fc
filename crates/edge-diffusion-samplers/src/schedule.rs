//! Noise schedules for diffusion models
//!
//! This module provides the beta schedule, the scheduler configuration and
//! the inference timestep spacing shared by the samplers.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scheduler config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported beta schedule: {0}")]
    UnsupportedBetaSchedule(String),

    #[error("Unsupported prediction type: {0}")]
    UnsupportedPredictionType(String),

    #[error("Unsupported timestep spacing: {0}")]
    UnsupportedTimestepSpacing(String),

    #[error("num_train_timesteps must be at least 2, got {0}")]
    TrainTimesteps(usize),

    #[error("Betas must lie in [0, 1), got start={start}, end={end}")]
    BetaRange { start: f64, end: f64 },
}

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
///
/// - Epsilon (noise): SD 1.x
/// - V-prediction (velocity): SD 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    VPrediction,
}

impl FromStr for PredictionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            other => Err(ConfigError::UnsupportedPredictionType(other.to_string())),
        }
    }
}

impl TryFrom<String> for PredictionType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Beta schedule shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum BetaSchedule {
    /// Linear in beta
    Linear,
    /// Linear in sqrt(beta), squared (SD 1.x)
    #[default]
    ScaledLinear,
}

impl FromStr for BetaSchedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            other => Err(ConfigError::UnsupportedBetaSchedule(other.to_string())),
        }
    }
}

impl TryFrom<String> for BetaSchedule {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How inference timesteps are placed over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum TimestepSpacing {
    /// Evenly spaced from 0 to num_train_timesteps - 1, rounded
    Linspace,
    /// Multiples of the integer stride, plus `steps_offset`
    #[default]
    Leading,
    /// Evenly spaced ending at num_train_timesteps - 1
    Trailing,
}

impl FromStr for TimestepSpacing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linspace" => Ok(Self::Linspace),
            "leading" => Ok(Self::Leading),
            "trailing" => Ok(Self::Trailing),
            other => Err(ConfigError::UnsupportedTimestepSpacing(other.to_string())),
        }
    }
}

impl TryFrom<String> for TimestepSpacing {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TimestepSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linspace => "linspace",
            Self::Leading => "leading",
            Self::Trailing => "trailing",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Scheduler Configuration
// ============================================================================

/// PNDM scheduler configuration
///
/// Field names follow the diffusers `scheduler_config.json`, so an exported
/// config can be loaded directly with [`PndmConfig::from_file`]. Unknown keys
/// are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PndmConfig {
    /// Number of training timesteps
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub timestep_spacing: TimestepSpacing,
    /// Added to every `leading` timestep
    pub steps_offset: usize,
    /// Skip the Runge-Kutta warm-up and run the multistep method only
    pub skip_prk_steps: bool,
    pub prediction_type: PredictionType,
    /// Use 1.0 as the cumulative alpha past the last step instead of alpha_cumprod[0]
    pub set_alpha_to_one: bool,
}

impl Default for PndmConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            timestep_spacing: TimestepSpacing::Leading,
            steps_offset: 1,
            skip_prk_steps: true,
            prediction_type: PredictionType::Epsilon,
            set_alpha_to_one: false,
        }
    }
}

impl PndmConfig {
    /// Parse a diffusers-style scheduler config
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a diffusers-style `scheduler_config.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

// ============================================================================
// Noise Schedule
// ============================================================================

/// Precomputed noise schedule values, indexed by training timestep
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f32>,
    pub alphas: Vec<f32>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f32>,
    /// ᾱ used when the previous timestep falls before the start of the schedule
    pub final_alpha_cumprod: f32,
}

impl NoiseSchedule {
    /// Build a schedule, validating the beta range
    pub fn new(
        beta_schedule: BetaSchedule,
        num_steps: usize,
        beta_start: f64,
        beta_end: f64,
        set_alpha_to_one: bool,
    ) -> Result<Self, ConfigError> {
        if num_steps < 2 {
            return Err(ConfigError::TrainTimesteps(num_steps));
        }
        let valid = |b: f64| b.is_finite() && (0.0..1.0).contains(&b);
        if !valid(beta_start) || !valid(beta_end) {
            return Err(ConfigError::BetaRange {
                start: beta_start,
                end: beta_end,
            });
        }
        Ok(Self::build(
            beta_schedule,
            num_steps,
            beta_start,
            beta_end,
            set_alpha_to_one,
        ))
    }

    fn build(
        beta_schedule: BetaSchedule,
        num_steps: usize,
        beta_start: f64,
        beta_end: f64,
        set_alpha_to_one: bool,
    ) -> Self {
        let last = (num_steps - 1) as f64;
        let betas: Vec<f32> = match beta_schedule {
            BetaSchedule::Linear => (0..num_steps)
                .map(|i| (beta_start + (beta_end - beta_start) * i as f64 / last) as f32)
                .collect(),
            BetaSchedule::ScaledLinear => {
                let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
                (0..num_steps)
                    .map(|i| ((start + (end - start) * i as f64 / last) as f32).powi(2))
                    .collect()
            }
        };

        let alphas: Vec<f32> = betas.iter().map(|b| 1.0 - b).collect();

        // Cumulative product
        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        let mut cumprod = 1.0f32;
        for &alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        let final_alpha_cumprod = if set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        Self {
            betas,
            alphas,
            alphas_cumprod,
            final_alpha_cumprod,
        }
    }

    /// Build the schedule described by a scheduler config
    pub fn from_config(config: &PndmConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.beta_schedule,
            config.num_train_timesteps,
            config.beta_start,
            config.beta_end,
            config.set_alpha_to_one,
        )
    }

    /// Create the default SD 1.x schedule
    pub fn sd1x() -> Self {
        Self::build(BetaSchedule::ScaledLinear, 1000, 0.00085, 0.012, false)
    }

    /// Number of training steps
    pub fn num_train_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Get alpha_cumprod at a specific timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> Option<f32> {
        self.alphas_cumprod.get(t).copied()
    }
}

/// Generate the ascending timestep grid for inference
///
/// `num_inference_steps` must be in `1..=num_train_steps`.
pub fn spaced_timesteps(
    spacing: TimestepSpacing,
    num_inference_steps: usize,
    num_train_steps: usize,
    steps_offset: usize,
) -> Vec<usize> {
    let n = num_inference_steps;
    match spacing {
        TimestepSpacing::Leading => {
            let step_ratio = num_train_steps / n;
            (0..n).map(|i| i * step_ratio + steps_offset).collect()
        }
        TimestepSpacing::Linspace => {
            if n == 1 {
                return vec![0];
            }
            let last = (num_train_steps - 1) as f64;
            (0..n)
                .map(|i| (i as f64 * last / (n - 1) as f64).round() as usize)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = num_train_steps as f64 / n as f64;
            (0..n)
                .rev()
                .map(|i| {
                    ((num_train_steps as f64 - i as f64 * step_ratio).round() as usize)
                        .saturating_sub(1)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd1x_schedule() {
        let schedule = NoiseSchedule::sd1x();
        assert_eq!(schedule.num_train_steps(), 1000);
        assert_eq!(schedule.alphas_cumprod[0], 1.0 - schedule.betas[0]);
        assert!((schedule.betas[0] - 0.00085).abs() < 1e-7);
        assert!((schedule.betas[999] - 0.012).abs() < 1e-6);
        assert_eq!(schedule.final_alpha_cumprod, schedule.alphas_cumprod[0]);

        for w in schedule.alphas_cumprod.windows(2) {
            assert!(w[1] < w[0], "alpha_cumprod must be strictly decreasing");
        }
    }

    #[test]
    fn test_set_alpha_to_one() {
        let schedule =
            NoiseSchedule::new(BetaSchedule::ScaledLinear, 1000, 0.00085, 0.012, true).unwrap();
        assert_eq!(schedule.final_alpha_cumprod, 1.0);
    }

    #[test]
    fn test_linear_schedule() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 11, 0.0, 0.1, false).unwrap();
        assert!((schedule.betas[5] - 0.05).abs() < 1e-7);
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(matches!(
            NoiseSchedule::new(BetaSchedule::Linear, 1, 0.0, 0.1, false),
            Err(ConfigError::TrainTimesteps(1))
        ));
        assert!(matches!(
            NoiseSchedule::new(BetaSchedule::Linear, 10, 0.0, 1.5, false),
            Err(ConfigError::BetaRange { .. })
        ));
    }

    #[test]
    fn test_leading_timesteps() {
        let steps = spaced_timesteps(TimestepSpacing::Leading, 20, 1000, 1);
        assert_eq!(steps.len(), 20);
        assert_eq!(steps[0], 1);
        assert_eq!(steps[19], 951);
    }

    #[test]
    fn test_linspace_and_trailing_timesteps() {
        let linspace = spaced_timesteps(TimestepSpacing::Linspace, 4, 1000, 0);
        assert_eq!(linspace, vec![0, 333, 666, 999]);

        let trailing = spaced_timesteps(TimestepSpacing::Trailing, 4, 1000, 0);
        assert_eq!(trailing, vec![249, 499, 749, 999]);
    }

    #[test]
    fn test_config_defaults_and_json() {
        let json = r#"{
            "_class_name": "PNDMScheduler",
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "beta_start": 0.00085,
            "num_train_timesteps": 1000,
            "prediction_type": "v_prediction",
            "set_alpha_to_one": false,
            "skip_prk_steps": true,
            "steps_offset": 1,
            "trained_betas": null
        }"#;
        let config = PndmConfig::from_json(json).unwrap();
        assert_eq!(config.prediction_type, PredictionType::VPrediction);
        assert_eq!(config.timestep_spacing, TimestepSpacing::Leading);
        assert_eq!(
            PndmConfig {
                prediction_type: PredictionType::Epsilon,
                ..config
            },
            PndmConfig::default()
        );
    }

    #[test]
    fn test_unsupported_config_values() {
        assert!(matches!(
            "squaredcos_cap_v2".parse::<BetaSchedule>(),
            Err(ConfigError::UnsupportedBetaSchedule(_))
        ));
        assert!(matches!(
            "sample".parse::<PredictionType>(),
            Err(ConfigError::UnsupportedPredictionType(_))
        ));
        assert!(PndmConfig::from_json(r#"{"beta_schedule": "cosine"}"#).is_err());
    }
}
