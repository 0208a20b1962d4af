//! Server-side view of the trainable model.
//!
//! The aggregator never runs the network; it only needs to build a fresh
//! instance, move weights in and out of it and write it to disk. Training
//! and evaluation happen on the clients (see [`super::runtime::Client`]).

use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::parameters::{parameters_to_weights, weights_to_parameters, Parameters, ParametersError, Tensor, Weights};
use super::storage::write_atomic;

const MODEL_FORMAT: &str = "growda-model/1";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model io error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("model file {path} does not decode: {source}")]
    Format { path: PathBuf, #[source] source: serde_json::Error },
    #[error("model serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Parameters(#[from] ParametersError),
    #[error("weights do not match the architecture: {0}")]
    Layout(String),
}

pub trait TrainableModel: Send {
    fn get_weights(&self) -> Weights;
    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError>;
    /// Overwrites whatever is stored at `path`.
    fn save(&self, path: &Path) -> Result<(), ModelError>;
}

pub trait ModelFactory: Send + Sync {
    /// A freshly initialised model.
    fn create(&self) -> Box<dyn TrainableModel>;
    fn load(&self, path: &Path) -> Result<Box<dyn TrainableModel>, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl LayerSpec {
    pub fn new(name: &str, shape: &[usize]) -> Self { Self { name: name.into(), shape: shape.to_vec() } }
}

/// Weight layout of the 150x150 RGB chest X-ray classifier: three conv/pool
/// stages (32, 64, 128 filters, 3x3), a 128-unit dense layer and a sigmoid output.
pub fn pneumonia_cnn() -> Vec<LayerSpec> {
    vec![
        LayerSpec::new("conv2d/kernel", &[3, 3, 3, 32]),
        LayerSpec::new("conv2d/bias", &[32]),
        LayerSpec::new("conv2d_1/kernel", &[3, 3, 32, 64]),
        LayerSpec::new("conv2d_1/bias", &[64]),
        LayerSpec::new("conv2d_2/kernel", &[3, 3, 64, 128]),
        LayerSpec::new("conv2d_2/bias", &[128]),
        LayerSpec::new("dense/kernel", &[17 * 17 * 128, 128]),
        LayerSpec::new("dense/bias", &[128]),
        LayerSpec::new("dense_1/kernel", &[128, 1]),
        LayerSpec::new("dense_1/bias", &[1]),
    ]
}

#[derive(Debug, Clone)]
pub struct SequentialModel {
    layers: Vec<LayerSpec>,
    weights: Weights,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    format: String,
    layers: Vec<LayerSpec>,
    parameters: Parameters,
}

impl SequentialModel {
    /// Glorot-uniform kernels and zero biases.
    pub fn initialised(layers: Vec<LayerSpec>) -> Self {
        let mut rng = rand::thread_rng();
        let weights = layers
            .iter()
            .map(|l| {
                let mut t = Tensor::zeros(l.shape.clone());
                if let Some(limit) = glorot_limit(&l.shape) {
                    for v in &mut t.values { *v = rng.gen_range(-limit..limit); }
                }
                t
            })
            .collect();
        Self { layers, weights }
    }

    fn check_layout(&self, weights: &[Tensor]) -> Result<(), ModelError> {
        if weights.len() != self.layers.len() {
            return Err(ModelError::Layout(format!("expected {} tensors, got {}", self.layers.len(), weights.len())));
        }
        for (l, t) in self.layers.iter().zip(weights) {
            if l.shape != t.shape {
                return Err(ModelError::Layout(format!("{} expects shape {:?}, got {:?}", l.name, l.shape, t.shape)));
            }
        }
        Ok(())
    }
}

fn glorot_limit(shape: &[usize]) -> Option<f32> {
    let (fan_in, fan_out) = match shape {
        [] | [_] => return None,
        [i, o] => (*i, *o),
        [rest @ .., i, o] => {
            let receptive: usize = rest.iter().product();
            (receptive * i, receptive * o)
        }
    };
    let fans = (fan_in + fan_out) as f32;
    (fans > 0.0).then(|| (6.0 / fans).sqrt())
}

impl TrainableModel for SequentialModel {
    fn get_weights(&self) -> Weights { self.weights.clone() }

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError> {
        self.check_layout(&weights)?;
        self.weights = weights;
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let file = ModelFile { format: MODEL_FORMAT.into(), layers: self.layers.clone(), parameters: weights_to_parameters(&self.weights) };
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(path, &bytes).map_err(|source| ModelError::Io { path: path.to_path_buf(), source })
    }
}

/// Builds [`SequentialModel`]s for one fixed architecture.
#[derive(Debug, Clone)]
pub struct SequentialFactory {
    layers: Vec<LayerSpec>,
}

impl SequentialFactory {
    pub fn new(layers: Vec<LayerSpec>) -> Self { Self { layers } }
    pub fn pneumonia() -> Self { Self::new(pneumonia_cnn()) }
}

impl ModelFactory for SequentialFactory {
    fn create(&self) -> Box<dyn TrainableModel> { Box::new(SequentialModel::initialised(self.layers.clone())) }

    fn load(&self, path: &Path) -> Result<Box<dyn TrainableModel>, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Io { path: path.to_path_buf(), source })?;
        let file: ModelFile = serde_json::from_slice(&bytes).map_err(|source| ModelError::Format { path: path.to_path_buf(), source })?;
        if file.format != MODEL_FORMAT {
            return Err(ModelError::Layout(format!("unknown model format '{}'", file.format)));
        }
        let mut model = SequentialModel { layers: self.layers.clone(), weights: Vec::new() };
        model.set_weights(parameters_to_weights(&file.parameters)?)?;
        Ok(Box::new(model))
    }
}
