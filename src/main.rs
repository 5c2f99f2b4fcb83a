//! CLI entry point for SVDiff loading utilities

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use svdiff_candle::architecture::UNetArchitecture;
use svdiff_candle::hub::HubOptions;
use svdiff_candle::image_grid;
use svdiff_candle::layout::ShiftPolicy;
use svdiff_candle::loader::SpectralShiftLoader;
use svdiff_candle::schedulers::{self, SchedulerKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "svdiff")]
#[command(author = "rzem-ai")]
#[command(version = "0.1.0")]
#[command(about = "SVDiff spectral-shift loading utilities", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Precision {
    F32,
    F16,
    Bf16,
}

impl From<Precision> for DType {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a UNet with spectral shifts and print a parameter summary
    ///
    /// The pretrained model is a local diffusers directory or a HuggingFace
    /// Hub repository. Set HF_TOKEN for gated repositories.
    Load {
        /// Pretrained model directory or hub repository id
        #[arg(short, long)]
        pretrained: String,

        /// Model subfolder
        #[arg(long, default_value = "unet")]
        subfolder: String,

        /// Spectral-shift checkpoint: directory, file or hub repository id
        #[arg(short, long)]
        spectral_shifts: Option<String>,

        /// Parameter precision
        #[arg(long, value_enum)]
        dtype: Option<Precision>,

        /// Hub revision (branch, tag or commit)
        #[arg(long)]
        revision: Option<String>,

        /// Only shift weights whose name contains one of these patterns
        #[arg(long = "only")]
        only: Vec<String>,

        /// Stay on the CPU even if an accelerator is available
        #[arg(long)]
        cpu: bool,
    },

    /// Tile images into a grid
    Grid {
        #[arg(long)]
        rows: u32,

        #[arg(long)]
        cols: u32,

        /// Output image path
        #[arg(short, long, default_value = "grid.png")]
        output: PathBuf,

        /// Input images, row-major
        images: Vec<PathBuf>,
    },

    /// List the available samplers
    Schedulers {
        /// Show the default configuration of one sampler
        name: Option<SchedulerKind>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Load {
            pretrained,
            subfolder,
            spectral_shifts,
            dtype,
            revision,
            only,
            cpu,
        } => {
            let device = if cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available(0)?
            };
            println!("Using device: {:?}", device);

            let mut loader = SpectralShiftLoader::new(&pretrained)
                .subfolder(subfolder)
                .device(device)
                .hub_options(HubOptions {
                    revision,
                    ..HubOptions::default()
                });
            if let Some(reference) = spectral_shifts {
                loader = loader.spectral_shifts(reference);
            }
            if let Some(dtype) = dtype {
                loader = loader.dtype(dtype.into());
            }
            if !only.is_empty() {
                loader = loader.shift_policy(ShiftPolicy::Matching(only));
            }

            let unet = loader
                .load(&UNetArchitecture::default())
                .with_context(|| format!("Failed to load UNet from {pretrained}"))?;

            let shifts: Vec<_> = unet.shift_parameters().collect();
            let shift_values: usize = shifts.iter().map(|(_, t)| t.elem_count()).sum();
            let total_values: usize = unet.parameters.values().map(|t| t.elem_count()).sum();

            println!();
            println!("✓ UNet loaded");
            println!("  Source:           {}", unet.config.name_or_path.as_deref().unwrap_or("-"));
            println!("  DType:            {:?}", unet.dtype);
            println!("  Parameters:       {} tensors, {} values", unet.parameters.len(), total_values);
            println!("  Spectral shifts:  {} tensors, {} values", shifts.len(), shift_values);
            match &unet.spectral_shifts {
                Some(path) => println!("  Restored from:    {}", path.display()),
                None => println!("  Restored from:    - (zero shifts)"),
            }
            println!();
        }

        Commands::Grid {
            rows,
            cols,
            output,
            images,
        } => {
            let loaded = images
                .iter()
                .map(|path| {
                    image::open(path).with_context(|| format!("Failed to open {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            let grid = image_grid(&loaded, rows, cols)?;
            grid.save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✓ Saved {}x{} grid: {}", rows, cols, output.display());
        }

        Commands::Schedulers { name } => match name {
            Some(kind) => {
                println!("{kind}: {:#?}", (kind.constructor())());
            }
            None => {
                for name in schedulers::scheduler_names() {
                    println!("{name}");
                }
            }
        },
    }

    Ok(())
}
