//! Spectral-shift reparameterisation of weights
//!
//! SVDiff fine-tunes a weight `W = U diag(S) Vᵀ` by learning a shift of its
//! singular values only: `W' = U diag(relu(S + delta)) Vᵀ`. Weights of rank
//! above two are flattened to `[dims[0], rest]` first, 1-D weights are taken
//! as a single row.

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::init::Init;
use candle_nn::var_builder::SimpleBackend;
use nalgebra::DMatrix;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::layout::{shift_parameter_name, spectral_shape};

/// Apply a spectral shift to a weight tensor
///
/// The returned tensor has the weight's shape, dtype and device. An all-zero
/// shift returns the weight unchanged without decomposing it.
pub fn fold_spectral_shift(weight: &Tensor, delta: &Tensor) -> candle_core::Result<Tensor> {
    let expected = spectral_shape(weight.shape());
    if delta.elem_count() != expected.elem_count() {
        candle_core::bail!(
            "spectral shift of {} values does not fit a weight of shape {:?}",
            delta.elem_count(),
            weight.dims()
        );
    }

    let delta = delta.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    if delta.iter().all(|d| *d == 0.0) {
        return Ok(weight.clone());
    }

    let dims = weight.dims();
    let rows = if dims.len() >= 2 { dims[0] } else { 1 };
    let cols = weight.elem_count() / rows.max(1);

    let data = weight.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let matrix = DMatrix::from_row_slice(rows, cols, &data);
    let shifted = shift_singular_values(matrix, &delta)?;

    let mut values = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            values.push(shifted[(r, c)]);
        }
    }

    Tensor::from_vec(values, weight.shape(), &Device::Cpu)?
        .to_dtype(weight.dtype())?
        .to_device(weight.device())
}

/// Recompose `matrix` with its singular values (largest first) shifted by `delta`
fn shift_singular_values(matrix: DMatrix<f64>, delta: &[f64]) -> candle_core::Result<DMatrix<f64>> {
    let (rows, cols) = matrix.shape();
    let svd = matrix
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| candle_core::Error::Msg("singular value decomposition did not converge".into()))?;
    let u = svd
        .u
        .ok_or_else(|| candle_core::Error::Msg("missing left singular vectors".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| candle_core::Error::Msg("missing right singular vectors".into()))?;
    let singular = svd.singular_values;

    let mut order: Vec<usize> = (0..singular.len()).collect();
    order.sort_by(|&a, &b| singular[b].partial_cmp(&singular[a]).unwrap_or(Ordering::Equal));

    let mut out = DMatrix::<f64>::zeros(rows, cols);
    for (rank, &idx) in order.iter().enumerate() {
        let value = (singular[idx] + delta[rank]).max(0.0);
        if value == 0.0 {
            continue;
        }
        out += u.column(idx) * v_t.row(idx) * value;
    }
    Ok(out)
}

/// `VarBuilder` backend over a materialised parameter collection
///
/// Weights that have a shift entry in the collection are served folded.
pub struct SpectralShiftBackend {
    tensors: HashMap<String, Tensor>,
}

impl SpectralShiftBackend {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }
}

impl SimpleBackend for SpectralShiftBackend {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let tensor = self.get_unchecked(name, dtype, dev)?;
        if tensor.shape() != &s {
            candle_core::bail!(
                "shape mismatch for {name}: expected {:?}, got {:?}",
                s.dims(),
                tensor.dims()
            );
        }
        Ok(tensor)
    }

    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> candle_core::Result<Tensor> {
        let tensor = self.tensors.get(name).ok_or_else(|| {
            candle_core::Error::CannotFindTensor {
                path: name.to_string(),
            }
            .bt()
        })?;

        let tensor = match shift_parameter_name(name).and_then(|shift| self.tensors.get(&shift)) {
            Some(delta) => {
                debug!(parameter = %name, "Folding spectral shift");
                fold_spectral_shift(tensor, delta)?
            }
            None => tensor.clone(),
        };

        tensor.to_dtype(dtype)?.to_device(dev)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}
