//! Shape-only parameter layouts
//!
//! A model skeleton is built against [`ShapeRecorder`], a `VarBuilder` backend
//! that hands out zero-stride placeholders and writes down every requested
//! name and shape. Nothing is allocated per parameter, so the layout of a
//! multi-gigabyte UNet is known before any weight is read.

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::init::Init;
use candle_nn::var_builder::SimpleBackend;
use candle_nn::VarBuilder;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;

/// Name component that marks a spectral-shift parameter
pub const SHIFT_MARKER: &str = "delta";

/// Whether a parameter name denotes a spectral-shift parameter
pub fn is_shift_parameter(name: &str) -> bool {
    name.contains(SHIFT_MARKER)
}

/// Name of the shift parameter paired with a weight
///
/// `down_blocks.0.attentions.0.proj_in.weight` -> `down_blocks.0.attentions.0.proj_in.delta`
pub fn shift_parameter_name(weight_name: &str) -> Option<String> {
    if weight_name == "weight" {
        return Some(SHIFT_MARKER.to_string());
    }
    weight_name
        .strip_suffix(".weight")
        .map(|module| format!("{module}.{SHIFT_MARKER}"))
}

/// Shape of the shift vector for a weight of the given shape
///
/// Weights are viewed as `[dims[0], rest]` matrices (1-D weights as a single
/// row) and get one shift per singular value.
pub fn spectral_shape(weight_shape: &Shape) -> Shape {
    let dims = weight_shape.dims();
    let elems = weight_shape.elem_count();
    let rows = if dims.len() >= 2 { dims[0] } else { 1 };
    let cols = if rows == 0 { 0 } else { elems / rows };
    Shape::from(rows.min(cols))
}

/// Which weights of a model receive spectral shifts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShiftPolicy {
    /// Every `*.weight` parameter
    #[default]
    AllWeights,
    /// Only weights whose name contains one of the patterns
    Matching(Vec<String>),
    /// No shifts; the layout is the base layout
    Disabled,
}

impl ShiftPolicy {
    /// Whether the given parameter gets a shift vector
    pub fn shifts(&self, name: &str) -> bool {
        if shift_parameter_name(name).is_none() {
            return false;
        }
        match self {
            Self::AllWeights => true,
            Self::Matching(patterns) => patterns.iter().any(|p| name.contains(p.as_str())),
            Self::Disabled => false,
        }
    }
}

/// Ordered parameter name -> shape map without storage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterLayout {
    entries: BTreeMap<String, Shape>,
}

impl ParameterLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the parameters requested while `build` constructs a model
    pub fn record<F>(build: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> candle_core::Result<()>,
    {
        let recorder = ShapeRecorder::default();
        let vb = VarBuilder::from_backend(Box::new(recorder.clone()), DType::F32, Device::Cpu);
        build(vb)?;
        let layout = recorder.into_layout();
        debug!(parameters = layout.len(), "Recorded parameter layout");
        Ok(layout)
    }

    pub fn insert(&mut self, name: impl Into<String>, shape: impl Into<Shape>) {
        self.entries.insert(name.into(), shape.into());
    }

    pub fn get(&self, name: &str) -> Option<&Shape> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Shape)> {
        self.entries.iter().map(|(name, shape)| (name.as_str(), shape))
    }

    /// Entries that are spectral-shift parameters
    pub fn shift_entries(&self) -> impl Iterator<Item = (&str, &Shape)> {
        self.iter().filter(|(name, _)| is_shift_parameter(name))
    }

    /// Extend the layout with one shift vector per weight selected by `policy`
    pub fn with_spectral_shifts(&self, policy: &ShiftPolicy) -> Self {
        let mut layout = self.clone();
        for (name, shape) in self.iter() {
            if !policy.shifts(name) {
                continue;
            }
            if let Some(shift) = shift_parameter_name(name) {
                layout.entries.entry(shift).or_insert_with(|| spectral_shape(shape));
            }
        }
        layout
    }
}

/// `VarBuilder` backend that records requested shapes
#[derive(Clone, Default)]
pub struct ShapeRecorder {
    shapes: Arc<Mutex<BTreeMap<String, Shape>>>,
}

impl ShapeRecorder {
    pub fn into_layout(self) -> ParameterLayout {
        let entries = match self.shapes.lock() {
            Ok(shapes) => shapes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ParameterLayout { entries }
    }
}

impl SimpleBackend for ShapeRecorder {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        self.shapes
            .lock()
            .map_err(|_| candle_core::Error::Msg("shape recorder lock poisoned".to_string()))?
            .insert(name.to_string(), s.clone());
        Tensor::zeros((), dtype, dev)?.broadcast_as(s)
    }

    fn get_unchecked(&self, name: &str, _dtype: DType, _dev: &Device) -> candle_core::Result<Tensor> {
        Err(candle_core::Error::CannotFindTensor {
            path: name.to_string(),
        }
        .bt())
    }

    fn contains_tensor(&self, _name: &str) -> bool {
        false
    }
}
