//! SVDiff spectral-shift loading for candle diffusion models
//!
//! SVDiff fine-tunes a diffusion model by learning a shift of the singular
//! values of each weight matrix. This crate assembles such a model from a
//! pretrained Stable Diffusion UNet and an optional spectral-shift
//! checkpoint, using the Candle ML framework.
//!
//! ## Features
//!
//! - **Staged loading**: parameter layout recorded from config only, base
//!   weights merged with zero shifts, then materialised on the target device
//! - **Hub aware**: local diffusers directories or HuggingFace Hub repos
//! - **Image grids**: tile sample images for side-by-side inspection
//! - **Sampler registry**: `ddim`, `plms`, `lms`, `euler`, `euler_ancestral`,
//!   `dpm_solver++`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use svdiff_candle::architecture::UNetArchitecture;
//! use svdiff_candle::loader::SpectralShiftLoader;
//! use svdiff_candle::schedulers;
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = candle_core::Device::cuda_if_available(0)?;
//!     let unet = SpectralShiftLoader::new("runwayml/stable-diffusion-v1-5")
//!         .subfolder("unet")
//!         .spectral_shifts("my-user/svdiff-dog")
//!         .device(device)
//!         .load(&UNetArchitecture::default())?;
//!
//!     let scheduler = schedulers::scheduler("dpm_solver++").unwrap()().build(25)?;
//!     println!("{} timesteps", scheduler.timesteps().len());
//!     Ok(())
//! }
//! ```

pub mod architecture;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod grid;
pub mod hub;
pub mod layout;
pub mod loader;
pub mod schedulers;
pub mod spectral;

pub use error::{Result, SvdiffError};
pub use grid::image_grid;
pub use loader::{SpectralShiftLoader, SpectralShiftModel};
pub use schedulers::SCHEDULER_MAPPING;
