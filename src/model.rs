//! Model loading and inference.
//!
//! The ONNX artifact is read once at startup and turned into a runnable tract
//! plan. Running the plan only needs `&self`, so one [`ModelWrapper`] is shared
//! across all worker threads without locking.

use ndarray::Array4;
use std::fmt;
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

use crate::config::Settings;
use crate::models::ClassProbabilities;
use crate::preprocessing::tensor_shape;

const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("Failed to load model from {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Model produced {actual} outputs for {expected} classes")]
    OutputMismatch { expected: usize, actual: usize },
    #[error("Model produced a non-finite output")]
    NonFinite,
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A loaded network that maps one preprocessed image to raw class scores.
pub trait Classifier: Send + Sync {
    /// Exact tensor shape the network accepts.
    fn input_shape(&self) -> &[usize];

    /// Single forward pass. The returned vector is in the training label order.
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError>;
}

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct OnnxClassifier {
    plan: OnnxPlan,
    input_shape: Vec<usize>,
}

impl OnnxClassifier {
    /// Load and optimize an ONNX model with its input pinned to `input_shape`.
    pub fn load(path: impl AsRef<Path>, input_shape: [usize; 4]) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ModelError::Missing(path.to_path_buf()));
        }

        log::info!("Loading model from: {}", path.display());
        let [n, d1, d2, d3] = input_shape;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| load_error(path, e))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(n, d1, d2, d3)))
            .map_err(|e| load_error(path, e))?
            .into_optimized()
            .map_err(|e| load_error(path, e))?
            .into_runnable()
            .map_err(|e| load_error(path, e))?;

        log::info!("Model input shape: {:?}", input_shape);
        if let Ok(fact) = plan.model().output_fact(0) {
            log::info!("Model output fact: {:?}", fact);
        }

        Ok(Self {
            plan,
            input_shape: input_shape.to_vec(),
        })
    }
}

fn load_error(path: &Path, e: impl fmt::Display) -> ModelError {
    ModelError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

impl Classifier for OnnxClassifier {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_shape(input.shape(), &data)
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let first = outputs
            .first()
            .ok_or_else(|| ModelError::Inference("model returned no outputs".to_string()))?;
        let view = first
            .to_array_view::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        Ok(view.iter().copied().collect())
    }
}

/// The process-wide classifier paired with its ordered label set.
pub struct ModelWrapper {
    classifier: Box<dyn Classifier>,
    labels: Vec<String>,
}

impl ModelWrapper {
    pub fn new(classifier: impl Classifier + 'static, labels: Vec<String>) -> Self {
        Self {
            classifier: Box::new(classifier),
            labels,
        }
    }

    /// Load the ONNX artifact named in the settings.
    pub fn load(settings: &Settings) -> Result<Self, ModelError> {
        let shape = tensor_shape(settings.image_size, settings.tensor_layout);
        let classifier = OnnxClassifier::load(&settings.model_path, shape)?;
        log::info!("Model loaded successfully!");
        Ok(Self::new(classifier, settings.class_labels.clone()))
    }

    pub fn input_shape(&self) -> &[usize] {
        self.classifier.input_shape()
    }

    /// Run one image through the model and return a probability per label.
    pub fn predict(&self, input: &Array4<f32>) -> Result<ClassProbabilities, ModelError> {
        let expected = self.classifier.input_shape();
        if input.shape() != expected {
            return Err(ModelError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: input.shape().to_vec(),
            });
        }

        let raw = self.classifier.forward(input)?;
        if raw.len() != self.labels.len() {
            return Err(ModelError::OutputMismatch {
                expected: self.labels.len(),
                actual: raw.len(),
            });
        }
        let probabilities = into_distribution(raw)?;
        Ok(ClassProbabilities::from_labels(&self.labels, &probabilities))
    }
}

/// Pass probabilities through, turn logits into probabilities.
fn into_distribution(raw: Vec<f32>) -> Result<Vec<f32>, ModelError> {
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::NonFinite);
    }
    let sum: f32 = raw.iter().sum();
    if raw.iter().all(|v| *v >= 0.0) && (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE {
        return Ok(raw);
    }
    Ok(softmax(&raw))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / total).collect()
}
