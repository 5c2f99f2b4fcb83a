//! diffusers `config.json` schema for the UNet
//!
//! Only the fields that shape the parameter layout are read; the rest of the
//! file is ignored. Defaults follow diffusers' `UNet2DConditionModel`.

use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModelConfig,
};
use serde::{Deserialize, Serialize};

/// A value given either once for all blocks or per block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerBlock<T> {
    Uniform(T),
    Blocks(Vec<T>),
}

impl<T: Copy> PerBlock<T> {
    /// Value for block `index`, the last listed value past the end
    pub fn get(&self, index: usize) -> Option<T> {
        match self {
            Self::Uniform(value) => Some(*value),
            Self::Blocks(values) => values.get(index).or_else(|| values.last()).copied(),
        }
    }
}

/// UNet configuration as stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    #[serde(default = "default_channels")]
    pub in_channels: usize,
    #[serde(default = "default_channels")]
    pub out_channels: usize,
    #[serde(default)]
    pub center_input_sample: bool,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_down_blocks")]
    pub down_block_types: Vec<String>,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_one")]
    pub downsample_padding: usize,
    #[serde(default = "default_mid_block_scale_factor")]
    pub mid_block_scale_factor: f64,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_cross_attention_dim")]
    pub cross_attention_dim: usize,
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: PerBlock<usize>,
    #[serde(default = "default_transformer_layers")]
    pub transformer_layers_per_block: PerBlock<usize>,
    #[serde(default)]
    pub use_linear_projection: bool,
    #[serde(default)]
    pub sample_size: Option<usize>,
    /// Identifier the model was loaded from
    #[serde(rename = "_name_or_path", default, skip_serializing_if = "Option::is_none")]
    pub name_or_path: Option<String>,
}

fn default_channels() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_down_blocks() -> Vec<String> {
    vec![
        "CrossAttnDownBlock2D".to_string(),
        "CrossAttnDownBlock2D".to_string(),
        "CrossAttnDownBlock2D".to_string(),
        "DownBlock2D".to_string(),
    ]
}

fn default_block_out_channels() -> Vec<usize> {
    vec![320, 640, 1280, 1280]
}

fn default_layers_per_block() -> usize {
    2
}

fn default_mid_block_scale_factor() -> f64 {
    1.0
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_cross_attention_dim() -> usize {
    1280
}

fn default_attention_head_dim() -> PerBlock<usize> {
    PerBlock::Uniform(8)
}

fn default_transformer_layers() -> PerBlock<usize> {
    PerBlock::Uniform(1)
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: default_channels(),
            out_channels: default_channels(),
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            down_block_types: default_down_blocks(),
            block_out_channels: default_block_out_channels(),
            layers_per_block: default_layers_per_block(),
            downsample_padding: 1,
            mid_block_scale_factor: default_mid_block_scale_factor(),
            norm_num_groups: default_norm_num_groups(),
            norm_eps: default_norm_eps(),
            cross_attention_dim: default_cross_attention_dim(),
            attention_head_dim: default_attention_head_dim(),
            transformer_layers_per_block: default_transformer_layers(),
            use_linear_projection: false,
            sample_size: None,
            name_or_path: None,
        }
    }
}

impl UNetConfig {
    /// Convert to the configuration candle's UNet is built from
    pub fn to_candle(&self) -> UNet2DConditionModelConfig {
        let blocks = self
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| {
                let cross_attn = self
                    .down_block_types
                    .get(i)
                    .is_some_and(|kind| kind.starts_with("CrossAttn"));
                BlockConfig {
                    out_channels,
                    use_cross_attn: if cross_attn {
                        Some(self.transformer_layers_per_block.get(i).unwrap_or(1))
                    } else {
                        None
                    },
                    attention_head_dim: self.attention_head_dim.get(i).unwrap_or(8),
                }
            })
            .collect();

        UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sd15_config() {
        let json = r#"{
            "_class_name": "UNet2DConditionModel",
            "_diffusers_version": "0.6.0",
            "act_fn": "silu",
            "attention_head_dim": 8,
            "block_out_channels": [320, 640, 1280, 1280],
            "center_input_sample": false,
            "cross_attention_dim": 768,
            "down_block_types": [
                "CrossAttnDownBlock2D",
                "CrossAttnDownBlock2D",
                "CrossAttnDownBlock2D",
                "DownBlock2D"
            ],
            "downsample_padding": 1,
            "flip_sin_to_cos": true,
            "freq_shift": 0,
            "in_channels": 4,
            "layers_per_block": 2,
            "mid_block_scale_factor": 1,
            "norm_eps": 1e-05,
            "norm_num_groups": 32,
            "out_channels": 4,
            "sample_size": 64,
            "up_block_types": [
                "UpBlock2D",
                "CrossAttnUpBlock2D",
                "CrossAttnUpBlock2D",
                "CrossAttnUpBlock2D"
            ]
        }"#;
        let config: UNetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cross_attention_dim, 768);
        assert_eq!(config.sample_size, Some(64));
        assert!(config.name_or_path.is_none());

        let candle = config.to_candle();
        assert_eq!(candle.blocks.len(), 4);
        assert_eq!(candle.blocks[0].use_cross_attn, Some(1));
        assert_eq!(candle.blocks[3].use_cross_attn, None);
        assert_eq!(candle.blocks[2].attention_head_dim, 8);
        assert!(!candle.use_linear_projection);
    }

    #[test]
    fn test_per_block_head_dims() {
        let json = r#"{
            "attention_head_dim": [5, 10, 20, 20],
            "cross_attention_dim": 1024,
            "use_linear_projection": true,
            "_name_or_path": "stabilityai/stable-diffusion-2-1"
        }"#;
        let config: UNetConfig = serde_json::from_str(json).unwrap();
        let candle = config.to_candle();
        let dims: Vec<usize> = candle.blocks.iter().map(|b| b.attention_head_dim).collect();
        assert_eq!(dims, vec![5, 10, 20, 20]);
        assert!(candle.use_linear_projection);
        assert_eq!(
            config.name_or_path.as_deref(),
            Some("stabilityai/stable-diffusion-2-1")
        );
    }

    #[test]
    fn test_name_or_path_round_trip_key() {
        let mut config = UNetConfig::default();
        config.name_or_path = Some("runwayml/stable-diffusion-v1-5".to_string());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["_name_or_path"], "runwayml/stable-diffusion-v1-5");
    }
}
