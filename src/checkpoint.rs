//! Safetensors checkpoint reading and writing
//!
//! Pretrained weights and spectral-shift checkpoints are both plain
//! name -> tensor maps; this module decodes them into candle tensors.

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, SvdiffError};
use crate::hub::PretrainedFiles;
use crate::layout::is_shift_parameter;

/// Read every tensor of a safetensors file onto `device`
pub fn load_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Reading safetensors");

    let file_data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&file_data)?;

    let mut out = HashMap::with_capacity(tensors.len());
    for name in tensors.names() {
        let tensor = load_tensor_from_safetensors(&tensors, name, device)?;
        out.insert(name.to_string(), tensor);
    }
    Ok(out)
}

/// Read the full base parameter mapping of a pretrained model
pub fn load_pretrained_weights(files: &PretrainedFiles, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    if files.is_pickle() {
        let path = &files.weights[0];
        info!(path = %path.display(), "Reading PyTorch weights");
        for (name, tensor) in candle_core::pickle::read_all(path)? {
            state.insert(name, tensor.to_device(device)?);
        }
        return Ok(state);
    }

    for path in &files.weights {
        info!(path = %path.display(), "Reading pretrained weights");
        state.extend(load_safetensors(path, device)?);
    }
    Ok(state)
}

/// Write the spectral-shift entries of `parameters` as a checkpoint
///
/// Returns the number of tensors written.
pub fn save_spectral_shifts<P: AsRef<Path>>(
    parameters: &HashMap<String, Tensor>,
    path: P,
) -> Result<usize> {
    let path = path.as_ref();
    let shifts: HashMap<String, Tensor> = parameters
        .iter()
        .filter(|(name, _)| is_shift_parameter(name))
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    candle_core::safetensors::save(&shifts, path)?;
    info!(path = %path.display(), tensors = shifts.len(), "Saved spectral shifts");
    Ok(shifts.len())
}

/// Decode one tensor in its stored dtype
fn load_tensor_from_safetensors(tensors: &SafeTensors, key: &str, device: &Device) -> Result<Tensor> {
    let view = tensors.tensor(key)?;
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F64 => {
            let doubles: Vec<f64> = data
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            Tensor::from_vec(doubles, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        other => return Err(SvdiffError::UnsupportedDtype(other)),
    };

    Ok(tensor)
}

/// Cast when a target dtype is requested
pub(crate) fn maybe_cast(tensor: Tensor, dtype: Option<DType>) -> candle_core::Result<Tensor> {
    match dtype {
        Some(dtype) if tensor.dtype() != dtype => tensor.to_dtype(dtype),
        _ => Ok(tensor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_keeps_only_shifts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("spectral_shifts.safetensors");

        let mut parameters = HashMap::new();
        parameters.insert(
            "proj.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        parameters.insert(
            "proj.delta".to_string(),
            Tensor::new(&[0.25f32, -0.5], &Device::Cpu).unwrap(),
        );

        assert_eq!(save_spectral_shifts(&parameters, &path).unwrap(), 1);

        let loaded = load_safetensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 1);
        let delta = loaded["proj.delta"].to_vec1::<f32>().unwrap();
        assert_eq!(delta, vec![0.25, -0.5]);
    }

    #[test]
    fn test_half_precision_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "a.delta".to_string(),
            Tensor::new(&[1.5f32, 2.0], &Device::Cpu)
                .unwrap()
                .to_dtype(DType::F16)
                .unwrap(),
        );
        tensors.insert(
            "b.delta".to_string(),
            Tensor::new(&[-1.0f32], &Device::Cpu)
                .unwrap()
                .to_dtype(DType::BF16)
                .unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = load_safetensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded["a.delta"].dtype(), DType::F16);
        assert_eq!(loaded["b.delta"].dtype(), DType::BF16);
        let a = loaded["a.delta"].to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, vec![1.5, 2.0]);
    }

    #[test]
    fn test_maybe_cast() {
        let t = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        assert_eq!(maybe_cast(t.clone(), None).unwrap().dtype(), DType::F32);
        assert_eq!(maybe_cast(t, Some(DType::F16)).unwrap().dtype(), DType::F16);
    }
}
