//! Euler discrete sampler
//!
//! First-order ODE step on the Karras sigma grid:
//! `x_next = x + (sigma_next - sigma) * (x - x0) / sigma`.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::{
    Scheduler, SchedulerConfig, TimestepSpacing,
};

use super::common::{self, NoiseSchedule};

#[derive(Debug, Clone, Default)]
pub struct EulerDiscreteSchedulerConfig {
    pub schedule: NoiseSchedule,
}

impl SchedulerConfig for EulerDiscreteSchedulerConfig {
    fn build(&self, inference_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        Ok(Box::new(EulerDiscreteScheduler::new(inference_steps, self.clone())?))
    }
}

/// Timesteps and sigmas shared by the sigma-space samplers
#[derive(Debug, Clone)]
pub(crate) struct SigmaGrid {
    pub timesteps: Vec<usize>,
    /// One sigma per timestep, then a trailing zero
    pub sigmas: Vec<f64>,
    pub init_noise_sigma: f64,
}

impl SigmaGrid {
    pub fn new(schedule: &NoiseSchedule, inference_steps: usize) -> candle_core::Result<Self> {
        schedule.check_inference_steps(inference_steps)?;
        let alphas_cumprod = schedule.alphas_cumprod();
        let timesteps = schedule.timesteps(inference_steps);
        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| common::sigma(alphas_cumprod[t]))
            .collect();
        let max_sigma = sigmas.iter().cloned().fold(0.0, f64::max);
        sigmas.push(0.0);

        let init_noise_sigma = match schedule.timestep_spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
            TimestepSpacing::Leading => (max_sigma * max_sigma + 1.0).sqrt(),
        };

        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        })
    }

    pub fn index_of(&self, timestep: usize) -> candle_core::Result<usize> {
        match self.timesteps.iter().position(|&t| t == timestep) {
            Some(index) => Ok(index),
            None => candle_core::bail!("timestep {timestep} is not part of the schedule"),
        }
    }

    pub fn scale_model_input(&self, sample: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        let sigma = self.sigmas[self.index_of(timestep)?];
        sample.affine(1.0 / (sigma * sigma + 1.0).sqrt(), 0.)
    }

    pub fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        let sigma = self.sigmas[self.index_of(timestep)?];
        original + noise.affine(sigma, 0.)?
    }
}

#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    grid: SigmaGrid,
    pub config: EulerDiscreteSchedulerConfig,
}

impl EulerDiscreteScheduler {
    pub fn new(inference_steps: usize, config: EulerDiscreteSchedulerConfig) -> candle_core::Result<Self> {
        let grid = SigmaGrid::new(&config.schedule, inference_steps)?;
        Ok(Self { grid, config })
    }
}

impl Scheduler for EulerDiscreteScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.grid.timesteps
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        self.grid.add_noise(original, noise, timestep)
    }

    fn init_noise_sigma(&self) -> f64 {
        self.grid.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        self.grid.scale_model_input(sample, timestep)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> candle_core::Result<Tensor> {
        let index = self.grid.index_of(timestep)?;
        let sigma = self.grid.sigmas[index];
        let sigma_next = self.grid.sigmas[index + 1];

        let pred_original = common::predict_original_sigma(
            &self.config.schedule.prediction_type,
            model_output,
            sample,
            sigma,
        )?;
        let derivative = (sample - pred_original)?.affine(1.0 / sigma, 0.)?;
        sample + derivative.affine(sigma_next - sigma, 0.)?
    }
}
