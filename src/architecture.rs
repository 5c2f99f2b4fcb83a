//! Model architectures the loader can assemble
//!
//! An architecture knows its configuration schema and how to build a model
//! from a `VarBuilder`. The loader builds it twice: once against a shape
//! recorder to learn the parameter layout, once against the materialised
//! parameters.

use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use crate::config::UNetConfig;
use crate::error::Result;
use crate::layout::ParameterLayout;

/// A model family: configuration schema plus constructor
pub trait ModelArchitecture {
    type Config: DeserializeOwned + Clone + Debug;
    type Model;

    /// Build the model, requesting every parameter from `vb`
    fn build(&self, config: &Self::Config, vb: VarBuilder) -> candle_core::Result<Self::Model>;

    /// Record the identifier the model was loaded from in its configuration
    fn register_name_or_path(&self, _config: &mut Self::Config, _name_or_path: &str) {}

    /// Parameter names and shapes, without allocating parameter storage
    fn parameter_layout(&self, config: &Self::Config) -> Result<ParameterLayout> {
        ParameterLayout::record(|vb| self.build(config, vb).map(drop))
    }
}

/// Stable Diffusion conditional UNet
#[derive(Debug, Clone, Copy, Default)]
pub struct UNetArchitecture {
    pub use_flash_attn: bool,
}

impl ModelArchitecture for UNetArchitecture {
    type Config = UNetConfig;
    type Model = UNet2DConditionModel;

    fn build(&self, config: &UNetConfig, vb: VarBuilder) -> candle_core::Result<UNet2DConditionModel> {
        UNet2DConditionModel::new(
            vb,
            config.in_channels,
            config.out_channels,
            self.use_flash_attn,
            config.to_candle(),
        )
    }

    fn register_name_or_path(&self, config: &mut UNetConfig, name_or_path: &str) {
        config.name_or_path = Some(name_or_path.to_string());
    }
}
