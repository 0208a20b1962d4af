//! Weight collections and their wire encoding.
//!
//! A model's weights travel between clients and the aggregator as
//! [`Parameters`]: one base64 blob of little-endian `f32` values per tensor,
//! tagged with the tensor shape. [`Weights`] is the decoded, native form.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TENSOR_TYPE_F32LE: &str = "f32le";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParametersError {
    #[error("unsupported tensor type '{0}'")]
    UnsupportedTensorType(String),
    #[error("tensor {index}: {reason}")]
    InvalidTensor { index: usize, reason: String },
    #[error("shape {shape:?} expects {expected} values, found {found}")]
    ShapeMismatch { shape: Vec<usize>, expected: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Ordered layer tensors of one model.
pub type Weights = Vec<Tensor>;

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, ParametersError> {
        match element_count(&shape) {
            Some(expected) if expected == values.len() => Ok(Self { shape, values }),
            expected => Err(ParametersError::ShapeMismatch { expected: expected.unwrap_or(usize::MAX), found: values.len(), shape }),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = element_count(&shape).unwrap_or(0);
        Self { shape, values: vec![0.0; n] }
    }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
}

/// Product of the dimensions; a scalar (empty shape) holds one value.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
}

/// True when both collections have the same number of tensors with identical shapes.
pub fn same_layout(a: &[Tensor], b: &[Tensor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.shape == y.shape)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedTensor {
    pub shape: Vec<usize>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub tensor_type: String,
    pub tensors: Vec<EncodedTensor>,
}

pub fn weights_to_parameters(weights: &[Tensor]) -> Parameters {
    let tensors = weights
        .iter()
        .map(|t| {
            let mut bytes = Vec::with_capacity(t.values.len() * 4);
            for v in &t.values { bytes.extend_from_slice(&v.to_le_bytes()); }
            EncodedTensor { shape: t.shape.clone(), data: STANDARD.encode(bytes) }
        })
        .collect();
    Parameters { tensor_type: TENSOR_TYPE_F32LE.into(), tensors }
}

pub fn parameters_to_weights(params: &Parameters) -> Result<Weights, ParametersError> {
    if params.tensor_type != TENSOR_TYPE_F32LE {
        return Err(ParametersError::UnsupportedTensorType(params.tensor_type.clone()));
    }
    params.tensors.iter().enumerate().map(|(index, enc)| decode_tensor(index, enc)).collect()
}

fn decode_tensor(index: usize, enc: &EncodedTensor) -> Result<Tensor, ParametersError> {
    let invalid = |reason: String| ParametersError::InvalidTensor { index, reason };
    let bytes = STANDARD.decode(enc.data.as_bytes()).map_err(|e| invalid(format!("base64: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(invalid(format!("byte length {} is not a multiple of 4", bytes.len())));
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    Tensor::new(enc.shape.clone(), values).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_layers() {
        let w = vec![Tensor::new(vec![2, 2], vec![1.0, -2.5, 0.0, 3.25]).unwrap(), Tensor::new(vec![], vec![7.0]).unwrap()];
        let p = weights_to_parameters(&w);
        assert_eq!(p.tensor_type, "f32le");
        assert_eq!(p.tensors.len(), 2);
        assert_eq!(parameters_to_weights(&p).unwrap(), w);
    }

    #[test]
    fn rejects_shape_value_mismatch() {
        let mut p = weights_to_parameters(&[Tensor::zeros(vec![3])]);
        p.tensors[0].shape = vec![4];
        let err = parameters_to_weights(&p).unwrap_err();
        assert!(matches!(err, ParametersError::InvalidTensor { index: 0, .. }));
    }

    #[test]
    fn rejects_unknown_tensor_type_and_bad_base64() {
        let mut p = weights_to_parameters(&[Tensor::zeros(vec![1])]);
        p.tensor_type = "numpy.ndarray".into();
        assert_eq!(parameters_to_weights(&p), Err(ParametersError::UnsupportedTensorType("numpy.ndarray".into())));

        let p = Parameters { tensor_type: TENSOR_TYPE_F32LE.into(), tensors: vec![EncodedTensor { shape: vec![1], data: "@@not base64@@".into() }] };
        assert!(parameters_to_weights(&p).is_err());
    }

    #[test]
    fn truncated_payload_is_invalid() {
        // three bytes cannot hold an f32
        let p = Parameters { tensor_type: TENSOR_TYPE_F32LE.into(), tensors: vec![EncodedTensor { shape: vec![1], data: STANDARD.encode([0u8, 1, 2]) }] };
        assert!(matches!(parameters_to_weights(&p), Err(ParametersError::InvalidTensor { .. })));
    }

    #[test]
    fn layout_comparison() {
        let a = vec![Tensor::zeros(vec![2, 3]), Tensor::zeros(vec![3])];
        let b = vec![Tensor::zeros(vec![2, 3]), Tensor::zeros(vec![3])];
        let c = vec![Tensor::zeros(vec![3, 2]), Tensor::zeros(vec![3])];
        assert!(same_layout(&a, &b));
        assert!(!same_layout(&a, &c));
        assert!(!same_layout(&a, &a[..1]));
    }
}
