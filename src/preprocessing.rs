//! Turns uploaded image bytes into the tensor the classifier was trained on.
//!
//! The pipeline is fixed: decode, convert to RGB, resize to the configured
//! target with Lanczos3, scale intensities to `[0, 1]`, add a batch axis.

use image::imageops::{self, FilterType};
use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::Array4;
use std::io::Cursor;

use crate::config::{ImageSize, Settings, TensorLayout};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Invalid file type: {0}. Only JPEG and PNG are supported.")]
    UnsupportedContentType(String),
    #[error("Unsupported image encoding: {0:?}. Only JPEG and PNG are supported.")]
    UnsupportedEncoding(ImageFormat),
    #[error("Invalid image file: {0}")]
    InvalidImage(String),
    #[error("Image too small: {width}x{height}, each side must be at least {min}px")]
    TooSmall { width: u32, height: u32, min: u32 },
    #[error("Image too large: {width}x{height}, each side must be at most {max}px")]
    TooLarge { width: u32, height: u32, max: u32 },
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    target: ImageSize,
    layout: TensorLayout,
    allowed_content_types: Vec<String>,
    min_dimension: u32,
    max_dimension: u32,
}

impl Preprocessor {
    pub fn from_settings(settings: &Settings) -> Self {
        log::info!(
            "ImagePreprocessor initialized with target size {} ({:?})",
            settings.image_size,
            settings.tensor_layout
        );
        Self {
            target: settings.image_size,
            layout: settings.tensor_layout,
            allowed_content_types: settings.allowed_content_types.clone(),
            min_dimension: settings.min_image_dimension,
            max_dimension: settings.max_image_dimension,
        }
    }

    /// Shape of a single-image tensor produced by [`Preprocessor::preprocess`].
    pub fn input_shape(&self) -> [usize; 4] {
        tensor_shape(self.target, self.layout)
    }

    /// Whether a declared content type (parameters ignored) is on the allow-list.
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        let essence = essence(content_type);
        self.allowed_content_types.iter().any(|ct| *ct == essence)
    }

    /// Decode an upload after checking its declared type, sniffed encoding and
    /// header dimensions. Pixel data is only decoded once the header passes.
    pub fn decode(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<DynamicImage, PreprocessError> {
        match content_type {
            Some(ct) if self.accepts_content_type(ct) => {}
            Some(ct) => return Err(PreprocessError::UnsupportedContentType(ct.to_string())),
            None => return Err(PreprocessError::UnsupportedContentType("unknown".to_string())),
        }

        let format = image::guess_format(bytes)
            .map_err(|_| PreprocessError::InvalidImage("unrecognized image data".to_string()))?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
            return Err(PreprocessError::UnsupportedEncoding(format));
        }

        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(|e| PreprocessError::InvalidImage(e.to_string()))?;
        if width < self.min_dimension || height < self.min_dimension {
            return Err(PreprocessError::TooSmall {
                width,
                height,
                min: self.min_dimension,
            });
        }
        if width > self.max_dimension || height > self.max_dimension {
            return Err(PreprocessError::TooLarge {
                width,
                height,
                max: self.max_dimension,
            });
        }

        image::load_from_memory_with_format(bytes, format)
            .map_err(|e| PreprocessError::InvalidImage(e.to_string()))
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let resized = self.resize(image);
        let (w, h) = (self.target.width as usize, self.target.height as usize);
        let tensor = match self.layout {
            TensorLayout::Nhwc => Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| {
                scale(resized.get_pixel(x as u32, y as u32)[c])
            }),
            TensorLayout::Nchw => Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
                scale(resized.get_pixel(x as u32, y as u32)[c])
            }),
        };
        log::debug!("Preprocessed image shape: {:?}", tensor.shape());
        tensor
    }

    fn resize(&self, image: &DynamicImage) -> RgbImage {
        let rgb = image.to_rgb8();
        if rgb.dimensions() == (self.target.width, self.target.height) {
            return rgb;
        }
        imageops::resize(&rgb, self.target.width, self.target.height, FilterType::Lanczos3)
    }
}

/// Shape of a single-image tensor for a target size and layout.
pub fn tensor_shape(target: ImageSize, layout: TensorLayout) -> [usize; 4] {
    let (w, h) = (target.width as usize, target.height as usize);
    match layout {
        TensorLayout::Nhwc => [1, h, w, 3],
        TensorLayout::Nchw => [1, 3, h, w],
    }
}

fn scale(v: u8) -> f32 {
    v as f32 / 255.0
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
