pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod model;
pub mod models;
pub mod preprocessing;

use std::sync::Arc;

use config::Settings;
use error::ApiError;
use model::ModelWrapper;
use preprocessing::Preprocessor;

/// Read-only state shared by every worker.
pub struct AppState {
    pub settings: Settings,
    pub preprocessor: Preprocessor,
    model: Option<Arc<ModelWrapper>>,
}

impl AppState {
    /// `model` is `None` when the artifact failed to load; the service then
    /// reports itself degraded and refuses predictions.
    pub fn new(settings: Settings, model: Option<ModelWrapper>) -> Self {
        let preprocessor = Preprocessor::from_settings(&settings);
        if let Some(model) = &model {
            if model.input_shape() != preprocessor.input_shape() {
                log::error!(
                    "Model expects input {:?} but images are preprocessed to {:?}",
                    model.input_shape(),
                    preprocessor.input_shape()
                );
            }
        }
        Self {
            preprocessor,
            settings,
            model: model.map(Arc::new),
        }
    }

    pub fn model(&self) -> Result<Arc<ModelWrapper>, ApiError> {
        self.model.clone().ok_or(ApiError::ModelUnavailable)
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Number of ranked classes to return, clamped to the label set.
    pub fn top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.top_k)
            .clamp(1, self.settings.class_labels.len().max(1))
    }
}
