//! DPM-Solver++ multistep sampler
//!
//! Second-order midpoint variant in data-prediction form. The first step and,
//! for short schedules, the last step fall back to first order.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::{
    PredictionType, Scheduler, SchedulerConfig,
};

use super::common::{self, NoiseSchedule};

#[derive(Debug, Clone)]
pub struct DpmSolverMultistepSchedulerConfig {
    pub schedule: NoiseSchedule,
    /// 1 or 2
    pub solver_order: usize,
    /// Use first order on the final step when there are fewer than 15 steps
    pub lower_order_final: bool,
}

impl Default for DpmSolverMultistepSchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: NoiseSchedule::default(),
            solver_order: 2,
            lower_order_final: true,
        }
    }
}

impl SchedulerConfig for DpmSolverMultistepSchedulerConfig {
    fn build(&self, inference_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        Ok(Box::new(DpmSolverMultistepScheduler::new(inference_steps, self.clone())?))
    }
}

#[derive(Debug, Clone)]
pub struct DpmSolverMultistepScheduler {
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    /// Data predictions of the previous step, newest last
    model_outputs: Vec<(usize, Tensor)>,
    lower_order_nums: usize,
    pub config: DpmSolverMultistepSchedulerConfig,
}

impl DpmSolverMultistepScheduler {
    pub fn new(inference_steps: usize, config: DpmSolverMultistepSchedulerConfig) -> candle_core::Result<Self> {
        config.schedule.check_inference_steps(inference_steps)?;
        if !(1..=2).contains(&config.solver_order) {
            candle_core::bail!("solver order {} is not supported", config.solver_order);
        }
        Ok(Self {
            alphas_cumprod: config.schedule.alphas_cumprod(),
            timesteps: config.schedule.timesteps(inference_steps),
            model_outputs: Vec::with_capacity(2),
            lower_order_nums: 0,
            config,
        })
    }

    /// `(alpha_t, sigma_t, lambda_t)` of the variance-preserving process
    fn coefficients(&self, timestep: usize) -> (f64, f64, f64) {
        let alpha_prod = self.alphas_cumprod[timestep];
        let alpha = alpha_prod.sqrt();
        let sigma = (1.0 - alpha_prod).sqrt();
        (alpha, sigma, alpha.ln() - sigma.ln())
    }

    fn data_prediction(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> candle_core::Result<Tensor> {
        let (alpha, sigma, _) = self.coefficients(timestep);
        match self.config.schedule.prediction_type {
            PredictionType::Epsilon => {
                (sample - model_output.affine(sigma, 0.)?)?.affine(1.0 / alpha, 0.)
            }
            PredictionType::VPrediction => sample.affine(alpha, 0.)? - model_output.affine(sigma, 0.)?,
            PredictionType::Sample => Ok(model_output.clone()),
        }
    }

    fn first_order_update(
        &self,
        x0: &Tensor,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (_, sigma_s, lambda_s) = self.coefficients(timestep);
        let (alpha_t, sigma_t, lambda_t) = self.coefficients(prev_timestep);
        let h = lambda_t - lambda_s;
        sample.affine(sigma_t / sigma_s, 0.)? - x0.affine(alpha_t * ((-h).exp() - 1.0), 0.)?
    }

    fn second_order_update(
        &self,
        m0: &Tensor,
        m1: &Tensor,
        s1: usize,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (_, sigma_s0, lambda_s0) = self.coefficients(timestep);
        let (_, _, lambda_s1) = self.coefficients(s1);
        let (alpha_t, sigma_t, lambda_t) = self.coefficients(prev_timestep);

        let h = lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let r0 = h_0 / h;
        let d1 = (m0 - m1)?.affine(1.0 / r0, 0.)?;
        let phi = alpha_t * ((-h).exp() - 1.0);

        ((sample.affine(sigma_t / sigma_s0, 0.)? - m0.affine(phi, 0.)?)? - d1.affine(0.5 * phi, 0.)?)
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        common::add_noise_vp(original, noise, self.alphas_cumprod[timestep])
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> candle_core::Result<Tensor> {
        Ok(sample)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> candle_core::Result<Tensor> {
        let index = match self.timesteps.iter().position(|&t| t == timestep) {
            Some(index) => index,
            None => candle_core::bail!("timestep {timestep} is not part of the schedule"),
        };
        let prev_timestep = self.timesteps.get(index + 1).copied().unwrap_or(0);
        let last_step = index + 1 == self.timesteps.len();
        let lower_order_final = last_step && self.config.lower_order_final && self.timesteps.len() < 15;

        let x0 = self.data_prediction(model_output, timestep, sample)?;

        let prev_sample = match self.model_outputs.last() {
            Some((s1, m1))
                if self.config.solver_order == 2 && self.lower_order_nums >= 1 && !lower_order_final =>
            {
                self.second_order_update(&x0, m1, *s1, timestep, prev_timestep, sample)?
            }
            _ => self.first_order_update(&x0, timestep, prev_timestep, sample)?,
        };

        self.model_outputs.push((timestep, x0));
        if self.model_outputs.len() > self.config.solver_order {
            self.model_outputs.remove(0);
        }
        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }

        Ok(prev_sample)
    }
}
