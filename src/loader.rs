//! Loading pretrained weights into a spectral-shift model
//!
//! The loader runs in stages:
//! 1. resolve and read the base model (configuration + full parameter map)
//! 2. record the target layout from configuration only (no storage)
//! 3. merge zero shift parameters into the base map; its key set must equal
//!    the target layout
//! 4. materialise every parameter on the target device/dtype
//! 5. overlay a spectral-shift checkpoint, if any
//! 6. build the model from the materialised map
//!
//! ```rust,ignore
//! use svdiff_candle::architecture::UNetArchitecture;
//! use svdiff_candle::loader::SpectralShiftLoader;
//!
//! let unet = SpectralShiftLoader::new("runwayml/stable-diffusion-v1-5")
//!     .subfolder("unet")
//!     .spectral_shifts("path/to/checkpoint-dir")
//!     .dtype(candle_core::DType::F16)
//!     .device(candle_core::Device::cuda_if_available(0)?)
//!     .load(&UNetArchitecture::default())?;
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::architecture::ModelArchitecture;
use crate::checkpoint::{self, maybe_cast};
use crate::error::{Result, SvdiffError};
use crate::hub::{self, HubClient, HubFetch, HubOptions};
use crate::layout::{is_shift_parameter, ParameterLayout, ShiftPolicy};
use crate::spectral::SpectralShiftBackend;

/// A model assembled from base weights plus spectral shifts
pub struct SpectralShiftModel<M, C> {
    pub model: M,
    /// Configuration, tagged with the identifier it was loaded from
    pub config: C,
    /// Materialised parameters, shift vectors included
    pub parameters: HashMap<String, Tensor>,
    /// Checkpoint the shifts were restored from
    pub spectral_shifts: Option<PathBuf>,
    pub device: Device,
    pub dtype: DType,
    training: bool,
}

impl<M, C> SpectralShiftModel<M, C> {
    /// Always `false`: parameters are bound as constants, not `Var`s
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// The shift vectors, by parameter name
    pub fn shift_parameters(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.parameters
            .iter()
            .filter(|(name, _)| is_shift_parameter(name))
            .map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Write the shift vectors in the checkpoint format the loader reads
    pub fn save_spectral_shifts<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        checkpoint::save_spectral_shifts(&self.parameters, path)
    }
}

/// Builder for [`SpectralShiftModel`]s
pub struct SpectralShiftLoader {
    pretrained: String,
    subfolder: Option<String>,
    spectral_shifts: Option<String>,
    hub_options: HubOptions,
    hub: Option<Box<dyn HubFetch>>,
    dtype: Option<DType>,
    device: Device,
    shift_policy: ShiftPolicy,
}

impl SpectralShiftLoader {
    /// Start from a pretrained model directory or hub repository id
    pub fn new(pretrained: impl Into<String>) -> Self {
        Self {
            pretrained: pretrained.into(),
            subfolder: None,
            spectral_shifts: None,
            hub_options: HubOptions::default(),
            hub: None,
            dtype: None,
            device: Device::Cpu,
            shift_policy: ShiftPolicy::default(),
        }
    }

    /// Model subfolder inside the pretrained reference, e.g. `unet`
    pub fn subfolder(mut self, subfolder: impl Into<String>) -> Self {
        self.subfolder = Some(subfolder.into());
        self
    }

    /// Checkpoint directory, file or hub repository to restore shifts from
    pub fn spectral_shifts(mut self, reference: impl Into<String>) -> Self {
        self.spectral_shifts = Some(reference.into());
        self
    }

    pub fn hub_options(mut self, options: HubOptions) -> Self {
        self.hub_options = options;
        self
    }

    /// Use a custom fetcher instead of the Hugging Face Hub client
    pub fn hub(mut self, hub: Box<dyn HubFetch>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shift_policy(mut self, policy: ShiftPolicy) -> Self {
        self.shift_policy = policy;
        self
    }

    /// Assemble the model
    pub fn load<A: ModelArchitecture>(
        self,
        architecture: &A,
    ) -> Result<SpectralShiftModel<A::Model, A::Config>> {
        info!(
            pretrained = %self.pretrained,
            subfolder = ?self.subfolder,
            spectral_shifts = ?self.spectral_shifts,
            dtype = ?self.dtype,
            device = ?self.device,
            "Loading model with spectral shifts"
        );

        let hub: Box<dyn HubFetch> = match self.hub {
            Some(hub) => hub,
            None => Box::new(HubClient::new(&self.hub_options)?),
        };

        let files = hub::resolve_pretrained(&self.pretrained, self.subfolder.as_deref(), hub.as_ref())?;
        let mut config: A::Config = serde_json::from_slice(&std::fs::read(&files.config)?)?;
        let base_state = checkpoint::load_pretrained_weights(&files, &Device::Cpu)?;
        info!(parameters = base_state.len(), "Base weights loaded");

        let target_layout = architecture
            .parameter_layout(&config)?
            .with_spectral_shifts(&self.shift_policy);
        debug!(
            parameters = target_layout.len(),
            shifts = target_layout.shift_entries().count(),
            "Target layout recorded"
        );

        let dtype = self.dtype.unwrap_or(DType::F32);
        let merged = merge_spectral_shifts(base_state, &target_layout, &self.pretrained)?;
        let mut parameters = materialize(merged, &self.device, dtype)?;

        let spectral_shifts = match &self.spectral_shifts {
            Some(reference) => {
                let path = hub::resolve_spectral_shifts(reference, hub.as_ref())?;
                let restored = overlay_checkpoint(&mut parameters, &target_layout, &path, &self.device, dtype)?;
                info!(tensors = restored, "Resume from {}", path.display());
                Some(path)
            }
            None => None,
        };

        if let Some(requested) = self.dtype {
            for tensor in parameters.values_mut() {
                *tensor = tensor.to_dtype(requested)?;
            }
        }

        architecture.register_name_or_path(&mut config, &self.pretrained);

        let vb = VarBuilder::from_backend(
            Box::new(SpectralShiftBackend::new(parameters.clone())),
            dtype,
            self.device.clone(),
        );
        let model = architecture.build(&config, vb)?;

        self.device.synchronize()?;

        info!(
            parameters = parameters.len(),
            pretrained = %self.pretrained,
            "✓ Model assembled"
        );

        Ok(SpectralShiftModel {
            model,
            config,
            parameters,
            spectral_shifts,
            device: self.device,
            dtype,
            training: false,
        })
    }
}

/// Add zero shift parameters to a base map and check it matches `target`
///
/// Shift entries of the target that the base map lacks are zero-filled;
/// existing entries are kept. Fails listing every target name still
/// missing, then every base name the target does not have.
pub fn merge_spectral_shifts(
    mut base: HashMap<String, Tensor>,
    target: &ParameterLayout,
    pretrained: &str,
) -> Result<HashMap<String, Tensor>> {
    let mut zero_filled = 0usize;
    for (name, shape) in target.shift_entries() {
        if !base.contains_key(name) {
            base.insert(name.to_string(), Tensor::zeros(shape.clone(), DType::F32, &Device::Cpu)?);
            zero_filled += 1;
        }
    }
    debug!(zero_filled, "Zero-initialised spectral shifts");

    let mut missing: Vec<String> = target
        .names()
        .filter(|name| !base.contains_key(*name))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(SvdiffError::MissingKeys {
            pretrained: pretrained.to_string(),
            missing,
        });
    }

    let mut unexpected: Vec<String> = base
        .keys()
        .filter(|name| !target.contains(name))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(SvdiffError::UnexpectedKeys {
            pretrained: pretrained.to_string(),
            unexpected,
        });
    }

    Ok(base)
}

/// Move every parameter to `device` in `dtype`
pub fn materialize(
    parameters: HashMap<String, Tensor>,
    device: &Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>> {
    parameters
        .into_iter()
        .map(|(name, tensor)| {
            let tensor = maybe_cast(tensor.to_device(device)?, Some(dtype))?;
            Ok((name, tensor))
        })
        .collect()
}

/// Overwrite parameters with the entries of a spectral-shift checkpoint
///
/// Returns the number of parameters replaced.
pub fn overlay_checkpoint(
    parameters: &mut HashMap<String, Tensor>,
    target: &ParameterLayout,
    path: &Path,
    device: &Device,
    dtype: DType,
) -> Result<usize> {
    let restored = checkpoint::load_safetensors(path, device)?;
    let count = restored.len();

    for (name, tensor) in restored {
        let expected = target.get(&name).ok_or_else(|| SvdiffError::UnexpectedParameter {
            name: name.clone(),
            path: path.to_path_buf(),
        })?;
        if expected.dims() != tensor.dims() {
            return Err(SvdiffError::ShapeMismatch {
                name,
                expected: expected.dims().to_vec(),
                got: tensor.dims().to_vec(),
            });
        }
        parameters.insert(name, maybe_cast(tensor, Some(dtype))?);
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(entries: &[(&str, &[usize])]) -> ParameterLayout {
        let mut layout = ParameterLayout::new();
        for (name, dims) in entries {
            layout.insert(*name, dims.to_vec());
        }
        layout
    }

    fn base(entries: &[(&str, &[usize])]) -> HashMap<String, Tensor> {
        entries
            .iter()
            .map(|(name, dims)| {
                (
                    name.to_string(),
                    Tensor::ones(dims.to_vec(), DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_zero_fills_shifts() {
        let target = layout(&[("a.weight", &[3, 2]), ("a.delta", &[2]), ("a.bias", &[3])]);
        let merged = merge_spectral_shifts(
            base(&[("a.weight", &[3, 2]), ("a.bias", &[3])]),
            &target,
            "base",
        )
        .unwrap();

        assert_eq!(merged.len(), 3);
        let delta = merged["a.delta"].to_vec1::<f32>().unwrap();
        assert_eq!(delta, vec![0.0, 0.0]);
    }

    #[test]
    fn test_merge_keeps_existing_shift() {
        let target = layout(&[("a.weight", &[2, 2]), ("a.delta", &[2])]);
        let merged = merge_spectral_shifts(
            base(&[("a.weight", &[2, 2]), ("a.delta", &[2])]),
            &target,
            "base",
        )
        .unwrap();
        assert_eq!(merged["a.delta"].to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_merge_reports_all_missing() {
        let target = layout(&[
            ("a.weight", &[2, 2]),
            ("b.weight", &[2, 2]),
            ("c.bias", &[2]),
            ("a.delta", &[2]),
        ]);
        let err = merge_spectral_shifts(base(&[("a.weight", &[2, 2])]), &target, "org/model")
            .unwrap_err();
        match err {
            SvdiffError::MissingKeys { pretrained, missing } => {
                assert_eq!(pretrained, "org/model");
                assert_eq!(missing, vec!["b.weight".to_string(), "c.bias".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_rejects_unused_base_entries() {
        let target = layout(&[("a.weight", &[2, 2]), ("a.delta", &[2])]);
        let err = merge_spectral_shifts(
            base(&[("a.weight", &[2, 2]), ("legacy.weight", &[2]), ("b.bias", &[2])]),
            &target,
            "org/model",
        )
        .unwrap_err();
        match err {
            SvdiffError::UnexpectedKeys { pretrained, unexpected } => {
                assert_eq!(pretrained, "org/model");
                assert_eq!(unexpected, vec!["b.bias".to_string(), "legacy.weight".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_materialize_casts() {
        let params = base(&[("a.weight", &[2, 2])]);
        let out = materialize(params, &Device::Cpu, DType::F16).unwrap();
        assert_eq!(out["a.weight"].dtype(), DType::F16);

        let half = HashMap::from([(
            "a.weight".to_string(),
            Tensor::ones((2, 2), DType::F16, &Device::Cpu).unwrap(),
        )]);
        let out = materialize(half, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(out["a.weight"].dtype(), DType::F32);
    }

    #[test]
    fn test_overlay_rejects_unknown_and_misshapen() {
        let dir = tempfile::tempdir().unwrap();
        let target = layout(&[("a.weight", &[2, 2]), ("a.delta", &[2])]);
        let mut params = base(&[("a.weight", &[2, 2]), ("a.delta", &[2])]);

        let unknown = dir.path().join("unknown.safetensors");
        candle_core::safetensors::save(&base(&[("b.delta", &[2])]), &unknown).unwrap();
        let err = overlay_checkpoint(&mut params, &target, &unknown, &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, SvdiffError::UnexpectedParameter { .. }));

        let misshapen = dir.path().join("misshapen.safetensors");
        candle_core::safetensors::save(&base(&[("a.delta", &[3])]), &misshapen).unwrap();
        let err = overlay_checkpoint(&mut params, &target, &misshapen, &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, SvdiffError::ShapeMismatch { .. }));
    }
}
