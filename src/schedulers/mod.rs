//! Sampler registry
//!
//! Maps the short sampler names used on command lines and in configs to
//! scheduler constructors. `ddim` and `euler_ancestral` are candle's own
//! implementations; the others live in this module. All use the Stable
//! Diffusion v1 training schedule by default.

pub mod common;
pub mod dpm_solver;
pub mod euler;
pub mod lms;
pub mod pndm;

use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use std::fmt;
use std::str::FromStr;

pub use common::NoiseSchedule;
pub use dpm_solver::{DpmSolverMultistepScheduler, DpmSolverMultistepSchedulerConfig};
pub use euler::{EulerDiscreteScheduler, EulerDiscreteSchedulerConfig};
pub use lms::{LmsDiscreteScheduler, LmsDiscreteSchedulerConfig};
pub use pndm::{PndmScheduler, PndmSchedulerConfig};

/// Creates a scheduler configuration with default settings
pub type SchedulerConstructor = fn() -> Box<dyn SchedulerConfig>;

fn ddim() -> Box<dyn SchedulerConfig> {
    Box::new(DDIMSchedulerConfig::default())
}

fn plms() -> Box<dyn SchedulerConfig> {
    Box::new(PndmSchedulerConfig::default())
}

fn lms() -> Box<dyn SchedulerConfig> {
    Box::new(LmsDiscreteSchedulerConfig::default())
}

fn euler() -> Box<dyn SchedulerConfig> {
    Box::new(EulerDiscreteSchedulerConfig::default())
}

fn euler_ancestral() -> Box<dyn SchedulerConfig> {
    Box::new(EulerAncestralDiscreteSchedulerConfig::default())
}

fn dpm_solver_pp() -> Box<dyn SchedulerConfig> {
    Box::new(DpmSolverMultistepSchedulerConfig::default())
}

/// Sampler name -> constructor
pub static SCHEDULER_MAPPING: &[(&str, SchedulerConstructor)] = &[
    ("ddim", ddim),
    ("plms", plms),
    ("lms", lms),
    ("euler", euler),
    ("euler_ancestral", euler_ancestral),
    ("dpm_solver++", dpm_solver_pp),
];

/// Constructor registered under `name`
pub fn scheduler(name: &str) -> Option<SchedulerConstructor> {
    SCHEDULER_MAPPING
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, constructor)| *constructor)
}

/// Registered sampler names
pub fn scheduler_names() -> impl Iterator<Item = &'static str> {
    SCHEDULER_MAPPING.iter().map(|(name, _)| *name)
}

/// Typed view of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    Ddim,
    Plms,
    Lms,
    Euler,
    EulerAncestral,
    DpmSolverPlusPlus,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 6] = [
        Self::Ddim,
        Self::Plms,
        Self::Lms,
        Self::Euler,
        Self::EulerAncestral,
        Self::DpmSolverPlusPlus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ddim => "ddim",
            Self::Plms => "plms",
            Self::Lms => "lms",
            Self::Euler => "euler",
            Self::EulerAncestral => "euler_ancestral",
            Self::DpmSolverPlusPlus => "dpm_solver++",
        }
    }

    pub fn constructor(self) -> SchedulerConstructor {
        match self {
            Self::Ddim => ddim,
            Self::Plms => plms,
            Self::Lms => lms,
            Self::Euler => euler,
            Self::EulerAncestral => euler_ancestral,
            Self::DpmSolverPlusPlus => dpm_solver_pp,
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                format!(
                    "unknown scheduler `{s}`, expected one of: {}",
                    scheduler_names().collect::<Vec<_>>().join(", ")
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_keys() {
        let names: Vec<&str> = scheduler_names().collect();
        assert_eq!(
            names,
            vec!["ddim", "plms", "lms", "euler", "euler_ancestral", "dpm_solver++"]
        );
        assert!(scheduler("unknown").is_none());
        assert!(scheduler("DDIM").is_none());
    }

    #[test]
    fn test_constructors_are_distinct() {
        let built: HashSet<String> = SCHEDULER_MAPPING
            .iter()
            .map(|(_, constructor)| {
                let debug = format!("{:?}", constructor());
                debug.split(|c: char| c == ' ' || c == '{').next().unwrap().to_string()
            })
            .collect();
        assert_eq!(built.len(), 6);
        assert!(built.contains("DDIMSchedulerConfig"));
        assert!(built.contains("PndmSchedulerConfig"));
        assert!(built.contains("LmsDiscreteSchedulerConfig"));
        assert!(built.contains("EulerDiscreteSchedulerConfig"));
        assert!(built.contains("EulerAncestralDiscreteSchedulerConfig"));
        assert!(built.contains("DpmSolverMultistepSchedulerConfig"));
    }

    #[test]
    fn test_kind_matches_mapping() {
        for kind in SchedulerKind::ALL {
            let from_map = scheduler(kind.name()).unwrap();
            assert_eq!(
                format!("{:?}", from_map()),
                format!("{:?}", (kind.constructor())())
            );
            assert_eq!(kind.to_string().parse::<SchedulerKind>().unwrap(), kind);
        }
        assert!("heun".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn test_every_scheduler_builds_and_steps() {
        use candle_core::{DType, Device, Tensor};

        for (name, constructor) in SCHEDULER_MAPPING {
            let mut scheduler = constructor().build(10).unwrap();
            let timesteps = scheduler.timesteps().to_vec();
            assert!(!timesteps.is_empty(), "{name}");

            let mut sample = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu)
                .unwrap()
                .affine(scheduler.init_noise_sigma(), 0.)
                .unwrap();
            let eps = Tensor::full(0.1f32, (1, 2, 2), &Device::Cpu).unwrap();
            for t in timesteps {
                let input = scheduler.scale_model_input(sample.clone(), t).unwrap();
                assert_eq!(input.dims(), &[1, 2, 2]);
                sample = scheduler.step(&eps, t, &sample).unwrap();
            }
            assert_eq!(sample.dims(), &[1, 2, 2], "{name}");
        }
    }
}
