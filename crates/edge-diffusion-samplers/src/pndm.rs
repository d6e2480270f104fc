//! PNDM (Pseudo Numerical methods for Diffusion Models) scheduler
//!
//! Linear multistep integration over the most recent model outputs, with an
//! optional Runge-Kutta warm-up that builds the history before the multistep
//! phase starts. The default configuration (`skip_prk_steps = true`) runs the
//! multistep method only, seeding its history with one extra evaluation.

use burn::prelude::*;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

use crate::schedule::{
    spaced_timesteps, ConfigError, NoiseSchedule, PndmConfig, PredictionType,
};

/// Number of past model outputs kept for the multistep update
pub const HISTORY_LEN: usize = 4;

/// Model evaluations per Runge-Kutta warm-up group
const WARMUP_STAGES: usize = 4;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("set_timesteps must be called before step")]
    NotInitialized,

    #[error("Inference step count must be in 1..={max}, got {got}")]
    InvalidStepCount { got: usize, max: usize },

    #[error("Runge-Kutta warm-up needs at least 4 inference steps, got {0}")]
    WarmupTooShort(usize),

    #[error("Timestep {timestep} is outside the {num_train_timesteps}-step training schedule")]
    TimestepOutOfRange {
        timestep: usize,
        num_train_timesteps: usize,
    },

    #[error("Degenerate noise schedule at timestep {timestep} (previous {prev_timestep:?})")]
    DegenerateSchedule {
        timestep: usize,
        prev_timestep: Option<usize>,
    },
}

/// Result of a single scheduler step
#[derive(Debug, Clone)]
pub enum SchedulerOutput<B: Backend> {
    /// The sample advanced to the next inference timestep
    Committed(Tensor<B, 4>),
    /// A Runge-Kutta intermediate estimate, evaluated again by the caller
    Intermediate(Tensor<B, 4>),
}

impl<B: Backend> SchedulerOutput<B> {
    /// The sample to feed into the next model evaluation
    pub fn into_sample(self) -> Tensor<B, 4> {
        match self {
            Self::Committed(sample) | Self::Intermediate(sample) => sample,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Progress through one four-evaluation warm-up group
///
/// Each stage carries the running weighted sum of model outputs and the
/// sample the group started from.
#[derive(Debug, Clone)]
enum WarmupState<B: Backend> {
    Idle,
    Stage1 { acc: Tensor<B, 4>, sample: Tensor<B, 4> },
    Stage2 { acc: Tensor<B, 4>, sample: Tensor<B, 4> },
    Stage3 { acc: Tensor<B, 4>, sample: Tensor<B, 4> },
}

/// PNDM scheduler
pub struct PndmScheduler<B: Backend> {
    config: PndmConfig,
    schedule: NoiseSchedule,
    num_inference_steps: Option<usize>,
    /// Warm-up timesteps (empty when `skip_prk_steps` is set)
    warmup_timesteps: Vec<usize>,
    /// Warm-up followed by multistep timesteps, in execution order
    timesteps: Vec<usize>,
    /// Number of `step` calls since `set_timesteps`
    counter: usize,
    /// Recent model outputs, oldest first
    ets: VecDeque<Tensor<B, 4>>,
    warmup: WarmupState<B>,
}

impl<B: Backend> PndmScheduler<B> {
    /// Create a scheduler from a config
    pub fn new(config: PndmConfig) -> Result<Self, ConfigError> {
        let schedule = NoiseSchedule::from_config(&config)?;
        Ok(Self {
            config,
            schedule,
            num_inference_steps: None,
            warmup_timesteps: Vec::new(),
            timesteps: Vec::new(),
            counter: 0,
            ets: VecDeque::with_capacity(HISTORY_LEN),
            warmup: WarmupState::Idle,
        })
    }

    /// Compute the timestep sequence for `num_inference_steps` and reset all
    /// sampling state.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SchedulerError> {
        let num_train = self.schedule.num_train_steps();
        if num_inference_steps == 0 || num_inference_steps > num_train {
            return Err(SchedulerError::InvalidStepCount {
                got: num_inference_steps,
                max: num_train,
            });
        }
        if !self.config.skip_prk_steps && num_inference_steps < WARMUP_STAGES {
            return Err(SchedulerError::WarmupTooShort(num_inference_steps));
        }

        let base = spaced_timesteps(
            self.config.timestep_spacing,
            num_inference_steps,
            num_train,
            self.config.steps_offset,
        );

        let (warmup, multistep) = if self.config.skip_prk_steps {
            (Vec::new(), multistep_only_timesteps(&base))
        } else {
            let half_stride = num_train / num_inference_steps / 2;
            let plms = base[..base.len() - 3].iter().rev().copied().collect();
            (warmup_timesteps(&base, half_stride), plms)
        };

        let timesteps: Vec<usize> = warmup.iter().chain(multistep.iter()).copied().collect();
        if let Some(&timestep) = timesteps.iter().find(|&&t| t >= num_train) {
            return Err(SchedulerError::TimestepOutOfRange {
                timestep,
                num_train_timesteps: num_train,
            });
        }

        debug!(
            num_inference_steps,
            warmup = warmup.len(),
            spacing = %self.config.timestep_spacing,
            "PNDM timesteps set"
        );

        self.num_inference_steps = Some(num_inference_steps);
        self.warmup_timesteps = warmup;
        self.timesteps = timesteps;
        self.reset();
        Ok(())
    }

    /// Clear the history and counters, keeping the timesteps
    pub fn reset(&mut self) {
        self.counter = 0;
        self.ets.clear();
        self.warmup = WarmupState::Idle;
    }

    /// Timesteps in execution order
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn num_inference_steps(&self) -> Option<usize> {
        self.num_inference_steps
    }

    /// Number of `step` calls since the last `set_timesteps`
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Stored model outputs, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Tensor<B, 4>> {
        self.ets.iter()
    }

    pub fn history_len(&self) -> usize {
        self.ets.len()
    }

    pub fn config(&self) -> &PndmConfig {
        &self.config
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Standard deviation of the initial noise
    pub fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Advance `sample` using the model's prediction at `timestep`
    pub fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        self.step_output(model_output, timestep, sample)
            .map(SchedulerOutput::into_sample)
    }

    /// Like [`step`](Self::step), but reports whether the result is a
    /// committed sample or a warm-up intermediate.
    pub fn step_output(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<SchedulerOutput<B>, SchedulerError> {
        let num_inference_steps = self
            .num_inference_steps
            .ok_or(SchedulerError::NotInitialized)?;
        let num_train = self.schedule.num_train_steps();
        if timestep >= num_train {
            return Err(SchedulerError::TimestepOutOfRange {
                timestep,
                num_train_timesteps: num_train,
            });
        }

        let output = if self.counter < self.warmup_timesteps.len() {
            self.step_warmup(model_output, timestep, sample, num_inference_steps)?
        } else {
            SchedulerOutput::Committed(self.step_multistep(
                model_output,
                timestep,
                sample,
                num_inference_steps,
            )?)
        };
        self.counter += 1;
        Ok(output)
    }

    fn push_history(&mut self, model_output: Tensor<B, 4>) {
        while self.ets.len() >= HISTORY_LEN {
            self.ets.pop_front();
        }
        self.ets.push_back(model_output);
    }

    fn step_multistep(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
        num_inference_steps: usize,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let stride = self.schedule.num_train_steps() / num_inference_steps;

        // The second call only seeds the history: it blends the first output
        // with this one and leaves the sample where it is.
        let prev_timestep = if self.counter == 1 {
            Some(timestep)
        } else {
            self.push_history(model_output.clone());
            timestep.checked_sub(stride)
        };

        let ets = &self.ets;
        let model_output = match ets.len() {
            0 | 1 => match (self.counter, ets.back()) {
                (1, Some(first)) => first.clone() * 0.5 + model_output * 0.5,
                _ => model_output,
            },
            2 => (ets[1].clone() * 3.0 - ets[0].clone()) * 0.5,
            3 => {
                ets[2].clone() * (23.0f32 / 12.0) - ets[1].clone() * (16.0f32 / 12.0)
                    + ets[0].clone() * (5.0f32 / 12.0)
            }
            _ => {
                let n = ets.len();
                ets[n - 1].clone() * (55.0f32 / 24.0) - ets[n - 2].clone() * (59.0f32 / 24.0)
                    + ets[n - 3].clone() * (37.0f32 / 24.0)
                    - ets[n - 4].clone() * (9.0f32 / 24.0)
            }
        };

        self.prev_sample(sample, timestep, prev_timestep, model_output)
    }

    fn step_warmup(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
        num_inference_steps: usize,
    ) -> Result<SchedulerOutput<B>, SchedulerError> {
        let half_stride = self.schedule.num_train_steps() / num_inference_steps / 2;
        let diff = if self.counter % 2 == 0 { half_stride } else { 0 };
        let prev_timestep = timestep.checked_sub(diff);
        let group_timestep =
            self.warmup_timesteps[self.counter / WARMUP_STAGES * WARMUP_STAGES];

        let state = std::mem::replace(&mut self.warmup, WarmupState::Idle);
        let (next, start, output, committed) = match state {
            WarmupState::Idle => {
                self.push_history(model_output.clone());
                let acc = model_output.clone() * (1.0f32 / 6.0);
                let next = WarmupState::Stage1 {
                    acc,
                    sample: sample.clone(),
                };
                (next, sample, model_output, false)
            }
            WarmupState::Stage1 { acc, sample } => {
                let acc = acc + model_output.clone() * (1.0f32 / 3.0);
                let next = WarmupState::Stage2 {
                    acc,
                    sample: sample.clone(),
                };
                (next, sample, model_output, false)
            }
            WarmupState::Stage2 { acc, sample } => {
                let acc = acc + model_output.clone() * (1.0f32 / 3.0);
                let next = WarmupState::Stage3 {
                    acc,
                    sample: sample.clone(),
                };
                (next, sample, model_output, false)
            }
            WarmupState::Stage3 { acc, sample } => {
                let output = acc + model_output * (1.0f32 / 6.0);
                (WarmupState::Idle, sample, output, true)
            }
        };
        self.warmup = next;

        let prev = self.prev_sample(start, group_timestep, prev_timestep, output)?;
        Ok(if committed {
            SchedulerOutput::Committed(prev)
        } else {
            SchedulerOutput::Intermediate(prev)
        })
    }

    /// Formula (9) of the PNDM paper: move `sample` from `timestep` to
    /// `prev_timestep` given the (combined) model output.
    fn prev_sample(
        &self,
        sample: Tensor<B, 4>,
        timestep: usize,
        prev_timestep: Option<usize>,
        model_output: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let num_train = self.schedule.num_train_steps();
        let alpha_at = |t: usize| {
            self.schedule
                .alpha_cumprod_at(t)
                .map(f64::from)
                .ok_or(SchedulerError::TimestepOutOfRange {
                    timestep: t,
                    num_train_timesteps: num_train,
                })
        };

        let alpha_prod_t = alpha_at(timestep)?;
        let alpha_prod_t_prev = match prev_timestep {
            Some(prev) => alpha_at(prev)?,
            None => f64::from(self.schedule.final_alpha_cumprod),
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        if alpha_prod_t <= 0.0 || denom == 0.0 || !denom.is_finite() || !sample_coeff.is_finite()
        {
            return Err(SchedulerError::DegenerateSchedule {
                timestep,
                prev_timestep,
            });
        }
        let output_coeff = (alpha_prod_t_prev - alpha_prod_t) / denom;

        let model_output = match self.config.prediction_type {
            PredictionType::Epsilon => model_output,
            PredictionType::VPrediction => {
                model_output * (alpha_prod_t.sqrt() as f32)
                    + sample.clone() * (beta_prod_t.sqrt() as f32)
            }
        };

        Ok(sample * (sample_coeff as f32) - model_output * (output_coeff as f32))
    }
}

/// Multistep-only sequence: the penultimate grid point is repeated so the
/// second evaluation can seed the history, then the grid runs descending.
fn multistep_only_timesteps(base: &[usize]) -> Vec<usize> {
    let n = base.len();
    let mut steps = base[..n - 1].to_vec();
    if n >= 2 {
        steps.push(base[n - 2]);
    }
    steps.push(base[n - 1]);
    steps.reverse();
    steps.truncate(n);
    steps
}

/// Warm-up sequence over the last four grid points, each split at its
/// half stride and visited twice.
fn warmup_timesteps(base: &[usize], half_stride: usize) -> Vec<usize> {
    let tail = &base[base.len() - WARMUP_STAGES..];
    let mut points: Vec<usize> = tail.iter().flat_map(|&t| [t, t + half_stride]).collect();
    points.pop();

    let mut steps: Vec<usize> = points.iter().flat_map(|&t| [t, t]).collect();
    steps.remove(0);
    steps.pop();
    steps.reverse();
    steps
}
