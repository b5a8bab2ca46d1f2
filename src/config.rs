//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file named by
//! `CONFIG_FILE`, then the process environment (a `.env` file is folded into the
//! environment by [`Settings::load`]).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CLASS_LABELS: [&str; 6] =
    ["buildings", "forest", "glacier", "mountain", "sea", "street"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Model input size in pixels, written as `WIDTHxHEIGHT` in the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (w, h) = match s.split_once(|c: char| c == 'x' || c == ',') {
            Some((w, h)) => (w.trim(), h.trim()),
            // a single number means a square target
            None => (s.as_str(), s.as_str()),
        };
        let width: u32 = w.parse().map_err(|_| format!("bad width {w:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("bad height {h:?}"))?;
        if width == 0 || height == 0 {
            return Err("image size must be non-zero".to_string());
        }
        Ok(Self { width, height })
    }
}

/// Axis order of the tensor handed to the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, the layout of Keras exports.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`, the layout of PyTorch exports.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(Self::Nhwc),
            "nchw" => Ok(Self::Nchw),
            other => Err(format!("unknown tensor layout {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_title: String,
    pub api_version: String,
    pub api_description: String,

    pub host: String,
    pub port: u16,

    pub model_path: PathBuf,
    pub image_size: ImageSize,
    pub tensor_layout: TensorLayout,
    pub class_labels: Vec<String>,

    pub max_file_size: usize,
    pub allowed_content_types: Vec<String>,
    pub max_batch_files: usize,
    pub top_k: usize,
    pub min_image_dimension: u32,
    pub max_image_dimension: u32,

    pub allowed_origins: Vec<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub static_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_title: "Intel Image Classification API".to_string(),
            api_version: env!("CARGO_PKG_VERSION").to_string(),
            api_description: "API for classifying images into 6 categories".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_path: PathBuf::from("models/model.onnx"),
            image_size: ImageSize::new(150, 150),
            tensor_layout: TensorLayout::Nhwc,
            class_labels: DEFAULT_CLASS_LABELS.iter().map(|s| s.to_string()).collect(),
            max_file_size: 10 * 1024 * 1024,
            allowed_content_types: vec![
                "image/jpeg".to_string(),
                "image/jpg".to_string(),
                "image/png".to_string(),
            ],
            max_batch_files: 10,
            top_k: 3,
            min_image_dimension: 32,
            max_image_dimension: 4096,
            allowed_origins: vec!["*".to_string()],
            log_level: "info".to_string(),
            log_file: None,
            static_dir: PathBuf::from("static"),
        }
    }
}

impl Settings {
    /// Load settings from `.env`, the process environment and `CONFIG_FILE`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, used with the real
    /// environment by [`Settings::load`] and with maps in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match lookup("CONFIG_FILE") {
            Some(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        settings.apply_overrides(&lookup)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read a YAML settings file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("API_TITLE") {
            self.api_title = v;
        }
        if let Some(v) = lookup("API_VERSION") {
            self.api_version = v;
        }
        if let Some(v) = lookup("API_DESCRIPTION") {
            self.api_description = v;
        }
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = parse_var(lookup, "PORT")? {
            self.port = v;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(lookup, "IMAGE_SIZE")? {
            self.image_size = v;
        }
        if let Some(v) = parse_var(lookup, "TENSOR_LAYOUT")? {
            self.tensor_layout = v;
        }
        if let Some(v) = lookup("CLASS_LABELS") {
            self.class_labels = split_list(&v);
        }
        if let Some(v) = parse_var(lookup, "MAX_FILE_SIZE")? {
            self.max_file_size = v;
        }
        if let Some(v) = lookup("ALLOWED_CONTENT_TYPES") {
            self.allowed_content_types = split_list(&v);
        }
        if let Some(v) = parse_var(lookup, "MAX_BATCH_FILES")? {
            self.max_batch_files = v;
        }
        if let Some(v) = parse_var(lookup, "TOP_K")? {
            self.top_k = v;
        }
        if let Some(v) = parse_var(lookup, "MIN_IMAGE_DIMENSION")? {
            self.min_image_dimension = v;
        }
        if let Some(v) = parse_var(lookup, "MAX_IMAGE_DIMENSION")? {
            self.max_image_dimension = v;
        }
        if let Some(v) = lookup("ALLOWED_ORIGINS") {
            self.allowed_origins = split_list(&v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("LOG_FILE") {
            self.log_file = (!v.trim().is_empty()).then(|| PathBuf::from(v.trim()));
        }
        if let Some(v) = lookup("STATIC_DIR") {
            self.static_dir = PathBuf::from(v);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.class_labels.is_empty() {
            return Err(ConfigError::Invalid("class label set is empty".into()));
        }
        let mut seen = HashSet::new();
        for label in &self.class_labels {
            if label.trim().is_empty() {
                return Err(ConfigError::Invalid("class labels must not be blank".into()));
            }
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate class label {label:?}")));
            }
        }
        if self.image_size.width == 0 || self.image_size.height == 0 {
            return Err(ConfigError::Invalid("image size must be non-zero".into()));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::Invalid("max_file_size must be positive".into()));
        }
        if self.max_batch_files == 0 {
            return Err(ConfigError::Invalid("max_batch_files must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be positive".into()));
        }
        if self.min_image_dimension > self.max_image_dimension {
            return Err(ConfigError::Invalid(format!(
                "min_image_dimension {} exceeds max_image_dimension {}",
                self.min_image_dimension, self.max_image_dimension
            )));
        }
        if self.allowed_content_types.is_empty() {
            return Err(ConfigError::Invalid("no allowed content types".into()));
        }
        for ct in &mut self.allowed_content_types {
            *ct = ct.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
