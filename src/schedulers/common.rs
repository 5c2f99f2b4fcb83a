//! Noise schedule shared by the samplers in this crate

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::schedulers::{
    BetaSchedule, PredictionType, TimestepSpacing,
};

/// Training-time noise schedule and inference spacing
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub train_timesteps: usize,
    pub steps_offset: usize,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
}

impl Default for NoiseSchedule {
    /// Stable Diffusion v1 training schedule
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            steps_offset: 1,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Leading,
        }
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

impl NoiseSchedule {
    pub fn betas(&self) -> Vec<f64> {
        let n = self.train_timesteps;
        match self.beta_schedule {
            BetaSchedule::Linear => linspace(self.beta_start, self.beta_end, n),
            BetaSchedule::ScaledLinear => linspace(self.beta_start.sqrt(), self.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::SquaredcosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        }
    }

    /// Cumulative product of `1 - beta`
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut acc = 1.0;
        self.betas()
            .into_iter()
            .map(|beta| {
                acc *= 1.0 - beta;
                acc
            })
            .collect()
    }

    /// Number of train timesteps between two inference steps
    pub fn step_ratio(&self, inference_steps: usize) -> usize {
        self.train_timesteps / inference_steps.max(1)
    }

    /// Reject step counts the training schedule cannot space out
    pub fn check_inference_steps(&self, inference_steps: usize) -> candle_core::Result<()> {
        if inference_steps == 0 {
            candle_core::bail!("at least one inference step is required");
        }
        if inference_steps > self.train_timesteps {
            candle_core::bail!(
                "{inference_steps} inference steps exceed the {} train timesteps",
                self.train_timesteps
            );
        }
        Ok(())
    }

    /// Inference timesteps, descending and without repeats
    pub fn timesteps(&self, inference_steps: usize) -> Vec<usize> {
        let last = self.train_timesteps.saturating_sub(1);
        let mut timesteps: Vec<usize> = match self.timestep_spacing {
            TimestepSpacing::Leading => {
                let ratio = self.step_ratio(inference_steps);
                (0..inference_steps)
                    .map(|i| (i * ratio + self.steps_offset).min(last))
                    .collect()
            }
            TimestepSpacing::Linspace => linspace(0.0, last as f64, inference_steps)
                .into_iter()
                .map(|t| t.round() as usize)
                .collect(),
            TimestepSpacing::Trailing => {
                let ratio = self.train_timesteps as f64 / inference_steps.max(1) as f64;
                (1..=inference_steps)
                    .map(|i| ((i as f64 * ratio).round() as usize).saturating_sub(1))
                    .collect()
            }
        };
        // The clamp to the last train timestep can repeat the tail.
        timesteps.dedup();
        timesteps.reverse();
        timesteps
    }
}

/// `sqrt(alpha_bar) * x0 + sqrt(1 - alpha_bar) * noise`
pub fn add_noise_vp(original: &Tensor, noise: Tensor, alpha_prod: f64) -> candle_core::Result<Tensor> {
    (original.affine(alpha_prod.sqrt(), 0.)? + noise.affine((1. - alpha_prod).sqrt(), 0.)?)
}

/// Karras sigma of a timestep: `sqrt((1 - alpha_bar) / alpha_bar)`
pub fn sigma(alpha_prod: f64) -> f64 {
    ((1.0 - alpha_prod) / alpha_prod).sqrt()
}

/// Clean-sample estimate on the sigma parameterisation
pub fn predict_original_sigma(
    prediction_type: &PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    sigma: f64,
) -> candle_core::Result<Tensor> {
    match prediction_type {
        PredictionType::Epsilon => sample - model_output.affine(sigma, 0.)?,
        PredictionType::VPrediction => {
            let denom = sigma * sigma + 1.0;
            model_output.affine(-sigma / denom.sqrt(), 0.)? + sample.affine(1.0 / denom, 0.)?
        }
        PredictionType::Sample => Ok(model_output.clone()),
    }
}
