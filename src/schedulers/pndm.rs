//! Pseudo numerical methods (PNDM) sampler, PLMS variant
//!
//! The Runge-Kutta warmup is skipped: the second timestep is visited twice
//! to bootstrap the linear multistep history, after which noise predictions
//! are combined with 4th-order Adams-Bashforth weights.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::{
    PredictionType, Scheduler, SchedulerConfig,
};

use super::common::{self, NoiseSchedule};

#[derive(Debug, Clone)]
pub struct PndmSchedulerConfig {
    pub schedule: NoiseSchedule,
    /// Use `alpha_bar = 1` past the final step instead of `alphas_cumprod[0]`
    pub set_alpha_to_one: bool,
}

impl Default for PndmSchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: NoiseSchedule::default(),
            set_alpha_to_one: false,
        }
    }
}

impl SchedulerConfig for PndmSchedulerConfig {
    fn build(&self, inference_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        Ok(Box::new(PndmScheduler::new(inference_steps, self.clone())?))
    }
}

#[derive(Debug, Clone)]
pub struct PndmScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    timesteps: Vec<usize>,
    ets: Vec<Tensor>,
    cur_sample: Option<Tensor>,
    counter: usize,
    pub config: PndmSchedulerConfig,
}

impl PndmScheduler {
    pub fn new(inference_steps: usize, config: PndmSchedulerConfig) -> candle_core::Result<Self> {
        config.schedule.check_inference_steps(inference_steps)?;
        let alphas_cumprod = config.schedule.alphas_cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        let step_ratio = config.schedule.step_ratio(inference_steps);

        // [751, 501, 251, 1] becomes [751, 501, 501, 251, 1].
        let mut ascending = config.schedule.timesteps(inference_steps);
        ascending.reverse();
        let mut timesteps = ascending.clone();
        if ascending.len() >= 2 {
            timesteps.insert(ascending.len() - 1, ascending[ascending.len() - 2]);
        }
        timesteps.reverse();

        Ok(Self {
            alphas_cumprod,
            final_alpha_cumprod,
            step_ratio,
            timesteps,
            ets: Vec::with_capacity(4),
            cur_sample: None,
            counter: 0,
            config,
        })
    }

    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: usize,
        prev_timestep: Option<usize>,
        model_output: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = match prev_timestep {
            Some(t) => self.alphas_cumprod[t],
            None => self.final_alpha_cumprod,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let model_output = match self.config.schedule.prediction_type {
            PredictionType::Epsilon => model_output.clone(),
            PredictionType::VPrediction => {
                (model_output.affine(alpha_prod_t.sqrt(), 0.)? + sample.affine(beta_prod_t.sqrt(), 0.)?)?
            }
            PredictionType::Sample => {
                candle_core::bail!("the PNDM sampler does not support sample prediction")
            }
        };

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let output_denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        sample.affine(sample_coeff, 0.)?
            - model_output.affine((alpha_prod_t_prev - alpha_prod_t) / output_denom, 0.)?
    }
}

impl Scheduler for PndmScheduler {
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
        if timestep >= self.alphas_cumprod.len() {
            candle_core::bail!("timestep {timestep} is outside the training schedule");
        }

        let (timestep, prev_timestep) = if self.counter != 1 {
            if self.ets.len() > 3 {
                self.ets.remove(0);
            }
            self.ets.push(model_output.clone());
            (timestep, timestep.checked_sub(self.step_ratio))
        } else {
            (timestep + self.step_ratio, Some(timestep))
        };

        let n = self.ets.len();
        let (model_output, sample) = if n == 1 && self.counter == 0 {
            self.cur_sample = Some(sample.clone());
            (model_output.clone(), sample.clone())
        } else if n == 1 && self.counter == 1 {
            let cur_sample = self.cur_sample.take().unwrap_or_else(|| sample.clone());
            ((model_output + &self.ets[0])?.affine(0.5, 0.)?, cur_sample)
        } else if n == 2 {
            let output = (self.ets[1].affine(3.0, 0.)? - &self.ets[0])?.affine(0.5, 0.)?;
            (output, sample.clone())
        } else if n == 3 {
            let output = ((self.ets[2].affine(23.0, 0.)? - self.ets[1].affine(16.0, 0.)?)?
                + self.ets[0].affine(5.0, 0.)?)?
                .affine(1.0 / 12.0, 0.)?;
            (output, sample.clone())
        } else {
            let output = (((self.ets[3].affine(55.0, 0.)? - self.ets[2].affine(59.0, 0.)?)?
                + self.ets[1].affine(37.0, 0.)?)?
                - self.ets[0].affine(9.0, 0.)?)?
                .affine(1.0 / 24.0, 0.)?;
            (output, sample.clone())
        };

        let prev = self.prev_sample(&sample, timestep, prev_timestep, &model_output)?;
        self.counter += 1;
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_plms_timesteps_repeat_second() {
        let scheduler = PndmScheduler::new(4, Default::default()).unwrap();
        assert_eq!(scheduler.timesteps(), &[751, 501, 501, 251, 1]);
    }

    #[test]
    fn test_first_step_is_ddim_like() {
        // With an empty history the update is the deterministic DDIM step.
        let mut scheduler = PndmScheduler::new(4, Default::default()).unwrap();
        let alphas = scheduler.alphas_cumprod.clone();
        let sample = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        let eps = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();

        let next = scheduler.step(&eps, 751, &sample).unwrap().to_vec1::<f32>().unwrap();
        let expected = (alphas[501] / alphas[751]).sqrt() as f32;
        assert!((next[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_full_loop_runs() {
        let mut scheduler = PndmScheduler::new(6, Default::default()).unwrap();
        let mut sample = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        let eps = Tensor::full(0.05f32, 3, &Device::Cpu).unwrap();
        let timesteps = scheduler.timesteps().to_vec();
        assert_eq!(timesteps.len(), 7);
        for t in timesteps {
            sample = scheduler.step(&eps, t, &sample).unwrap();
        }
        assert!(scheduler.ets.len() <= 4);
        let values = sample.to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
