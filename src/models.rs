use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    #[serde(rename = "class")]
    pub label: String,
    pub probability: f32,
}

/// Per-class probabilities kept in class label order.
///
/// Serialized as a JSON object ordered from most to least likely class.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassProbabilities {
    scores: Vec<ClassScore>,
}

impl ClassProbabilities {
    /// Zip labels with model outputs. Both slices are expected to be the same length;
    /// extra entries on either side are ignored.
    pub fn from_labels(labels: &[String], values: &[f32]) -> Self {
        let scores = labels
            .iter()
            .zip(values)
            .map(|(label, &probability)| ClassScore {
                label: label.clone(),
                probability,
            })
            .collect();
        Self { scores }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassScore> {
        self.scores.iter()
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.scores
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.probability)
    }

    pub fn sum(&self) -> f32 {
        self.scores.iter().map(|s| s.probability).sum()
    }

    /// Most likely class; ties resolve to the earliest label.
    pub fn argmax(&self) -> Option<&ClassScore> {
        self.scores.iter().fold(None, |best, s| match best {
            Some(b) if b.probability >= s.probability => Some(b),
            _ => Some(s),
        })
    }

    /// All classes, most likely first. Equal probabilities keep label order.
    pub fn ranked(&self) -> Vec<ClassScore> {
        let mut ranked = self.scores.clone();
        ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        ranked
    }

    pub fn top_k(&self, k: usize) -> Vec<ClassScore> {
        let mut ranked = self.ranked();
        ranked.truncate(k);
        ranked
    }
}

impl Serialize for ClassProbabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ranked = self.ranked();
        let mut map = serializer.serialize_map(Some(ranked.len()))?;
        for score in &ranked {
            map.serialize_entry(&score.label, &score.probability)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub filename: String,
    pub predicted_class: String,
    pub confidence: f32,
    pub predictions: ClassProbabilities,
    pub top_k: Vec<ClassScore>,
    pub timestamp: DateTime<Utc>,
}

impl PredictionResult {
    /// Returns `None` when there are no probabilities to rank.
    pub fn new(filename: String, predictions: ClassProbabilities, k: usize) -> Option<Self> {
        let best = predictions.argmax()?.clone();
        Some(Self {
            filename,
            predicted_class: best.label,
            confidence: best.probability,
            top_k: predictions.top_k(k),
            predictions,
            timestamp: Utc::now(),
        })
    }
}

/// Outcome for one file of a batch request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchItem {
    Success(PredictionResult),
    Error { filename: String, error: String },
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub total: usize,
    pub results: Vec<BatchItem>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model_loaded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ClassesResponse {
    pub classes: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct Endpoint {
    pub method: &'static str,
    pub path: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub endpoints: Vec<Endpoint>,
}
