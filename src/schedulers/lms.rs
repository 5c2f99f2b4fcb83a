//! Linear multistep (LMS) discrete sampler
//!
//! Keeps the last `order` derivatives `(x - x0) / sigma` and combines them
//! with coefficients obtained by integrating the Lagrange basis polynomials
//! over `[sigma_i, sigma_{i+1}]`.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use std::collections::VecDeque;

use super::common::{self, NoiseSchedule};
use super::euler::SigmaGrid;

#[derive(Debug, Clone)]
pub struct LmsDiscreteSchedulerConfig {
    pub schedule: NoiseSchedule,
    /// Number of past derivatives combined per step
    pub order: usize,
}

impl Default for LmsDiscreteSchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: NoiseSchedule::default(),
            order: 4,
        }
    }
}

impl SchedulerConfig for LmsDiscreteSchedulerConfig {
    fn build(&self, inference_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        Ok(Box::new(LmsDiscreteScheduler::new(inference_steps, self.clone())?))
    }
}

#[derive(Debug, Clone)]
pub struct LmsDiscreteScheduler {
    grid: SigmaGrid,
    derivatives: VecDeque<Tensor>,
    pub config: LmsDiscreteSchedulerConfig,
}

impl LmsDiscreteScheduler {
    pub fn new(inference_steps: usize, config: LmsDiscreteSchedulerConfig) -> candle_core::Result<Self> {
        if config.order == 0 {
            candle_core::bail!("LMS order must be at least 1");
        }
        let grid = SigmaGrid::new(&config.schedule, inference_steps)?;
        Ok(Self {
            grid,
            derivatives: VecDeque::with_capacity(config.order),
            config,
        })
    }

    /// Coefficient of the derivative `current_order` steps back at step `index`
    pub fn lms_coefficient(&self, order: usize, index: usize, current_order: usize) -> f64 {
        let sigmas = &self.grid.sigmas;
        let basis = |tau: f64| {
            let mut prod = 1.0;
            for k in 0..order {
                if k == current_order {
                    continue;
                }
                prod *= (tau - sigmas[index - k]) / (sigmas[index - current_order] - sigmas[index - k]);
            }
            prod
        };
        simpson(basis, sigmas[index], sigmas[index + 1], 64)
    }
}

/// Composite Simpson rule; exact for the cubic bases of a 4th-order method
fn simpson<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, panels: usize) -> f64 {
    let n = panels.max(1) * 2;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(a + h * i as f64);
    }
    sum * h / 3.0
}

impl Scheduler for LmsDiscreteScheduler {
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

        let pred_original = common::predict_original_sigma(
            &self.config.schedule.prediction_type,
            model_output,
            sample,
            sigma,
        )?;
        let derivative = (sample - pred_original)?.affine(1.0 / sigma, 0.)?;
        self.derivatives.push_back(derivative);
        if self.derivatives.len() > self.config.order {
            self.derivatives.pop_front();
        }

        let order = self.config.order.min(index + 1);
        let mut prev_sample = sample.clone();
        for (current_order, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
            let coefficient = self.lms_coefficient(order, index, current_order);
            prev_sample = (prev_sample + derivative.affine(coefficient, 0.)?)?;
        }
        Ok(prev_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_first_coefficient_is_sigma_step() {
        let scheduler = LmsDiscreteScheduler::new(10, Default::default()).unwrap();
        let sigmas = &scheduler.grid.sigmas;
        let coefficient = scheduler.lms_coefficient(1, 0, 0);
        assert!((coefficient - (sigmas[1] - sigmas[0])).abs() < 1e-12);
    }

    #[test]
    fn test_coefficients_sum_to_step() {
        // The Lagrange basis sums to one, so the coefficients sum to the interval length.
        let scheduler = LmsDiscreteScheduler::new(10, Default::default()).unwrap();
        let sigmas = &scheduler.grid.sigmas;
        let sum: f64 = (0..4).map(|k| scheduler.lms_coefficient(4, 5, k)).sum();
        assert!((sum - (sigmas[6] - sigmas[5])).abs() < 1e-9);
    }

    #[test]
    fn test_step_keeps_history_bounded() {
        let mut scheduler = LmsDiscreteScheduler::new(8, Default::default()).unwrap();
        let mut sample = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let eps = Tensor::full(0.1f32, 4, &Device::Cpu).unwrap();
        let timesteps = scheduler.timesteps().to_vec();
        for t in timesteps {
            sample = scheduler.step(&eps, t, &sample).unwrap();
            assert!(scheduler.derivatives.len() <= 4);
        }
        let values = sample.to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
