use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::StreamExt;
use image::GenericImageView;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ApiError;
use crate::model::ModelWrapper;
use crate::models::{
    BatchItem, BatchResponse, ClassesResponse, Endpoint, HealthResponse, HealthStatus,
    PredictionResult, ServiceInfo,
};
use crate::preprocessing::Preprocessor;
use crate::AppState;

const DEFAULT_FILENAME: &str = "upload";

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub top_k: Option<usize>,
}

/// One file taken from a multipart body. `size` counts every byte received,
/// `bytes` stays empty once the size limit is exceeded.
#[derive(Debug)]
struct Upload {
    filename: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
    size: usize,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: Option<PathBuf>) {
    cfg.app_data(
        web::QueryConfig::default()
            .error_handler(|err, _| ApiError::validation(err.to_string()).into()),
    )
    .service(web::resource("/").route(web::get().to(root)))
    .service(web::resource("/health").route(web::get().to(health)))
    .service(web::resource("/classes").route(web::get().to(classes)))
    .service(web::resource("/predict").route(web::post().to(predict)))
    .service(web::resource("/predict-batch").route(web::post().to(predict_batch)));

    if let Some(dir) = static_dir {
        cfg.service(Files::new("/ui", dir).index_file("index.html"));
    }
}

async fn root(state: web::Data<AppState>) -> HttpResponse {
    let settings = &state.settings;
    HttpResponse::Ok().json(ServiceInfo {
        name: settings.api_title.clone(),
        version: settings.api_version.clone(),
        description: settings.api_description.clone(),
        endpoints: vec![
            Endpoint { method: "GET", path: "/health" },
            Endpoint { method: "GET", path: "/classes" },
            Endpoint { method: "POST", path: "/predict" },
            Endpoint { method: "POST", path: "/predict-batch" },
            Endpoint { method: "GET", path: "/ui/" },
        ],
    })
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let model_loaded = state.model_loaded();
    HttpResponse::Ok().json(HealthResponse {
        status: if model_loaded {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        },
        model_loaded,
        timestamp: Utc::now(),
    })
}

async fn classes(state: web::Data<AppState>) -> HttpResponse {
    let classes = state.settings.class_labels.clone();
    HttpResponse::Ok().json(ClassesResponse {
        total: classes.len(),
        classes,
    })
}

async fn predict(
    state: web::Data<AppState>,
    query: web::Query<PredictQuery>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let model = state.model()?;
    let top_k = state.top_k(query.top_k);

    let limits = UploadLimits {
        fields: &["file"],
        max_file_size: state.settings.max_file_size,
        max_files: 1,
        fail_fast: true,
    };
    let mut uploads = read_uploads(payload, limits).await?;
    let upload = uploads
        .pop()
        .ok_or_else(|| ApiError::validation("No file uploaded, expected multipart field 'file'"))?;
    validate_upload(&upload, &state)?;

    let result =
        web::block(move || classify(&state.preprocessor, &model, upload, top_k)).await??;
    Ok(HttpResponse::Ok().json(result))
}

async fn predict_batch(
    state: web::Data<AppState>,
    query: web::Query<PredictQuery>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let model = state.model()?;
    let top_k = state.top_k(query.top_k);

    let limits = UploadLimits {
        fields: &["files", "file"],
        max_file_size: state.settings.max_file_size,
        max_files: state.settings.max_batch_files,
        fail_fast: false,
    };
    let uploads = read_uploads(payload, limits).await?;
    if uploads.is_empty() {
        return Err(ApiError::validation(
            "No files uploaded, expected multipart fields named 'files'",
        ));
    }
    log::info!("Batch prediction for {} files", uploads.len());

    let results = web::block(move || {
        uploads
            .into_iter()
            .map(|upload| classify_batch_item(&state, &model, upload, top_k))
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(HttpResponse::Ok().json(BatchResponse {
        total: results.len(),
        results,
        timestamp: Utc::now(),
    }))
}

/// Size and count limits applied while a multipart body is streamed in.
struct UploadLimits<'a> {
    fields: &'a [&'a str],
    max_file_size: usize,
    max_files: usize,
    /// Refuse the whole request as soon as one file passes `max_file_size`.
    fail_fast: bool,
}

impl UploadLimits<'_> {
    /// Bytes accepted across every field, ignored ones included.
    fn max_total(&self) -> usize {
        self.max_file_size.saturating_mul(self.max_files)
    }
}

fn malformed(e: actix_multipart::MultipartError) -> ApiError {
    ApiError::validation(format!("Malformed multipart body: {e}"))
}

/// Collect files from the multipart fields named in `limits.fields`, ignoring
/// others. Stops reading once the request passes its byte budget.
async fn read_uploads(
    mut payload: Multipart,
    limits: UploadLimits<'_>,
) -> Result<Vec<Upload>, ApiError> {
    let max_total = limits.max_total();
    let mut uploads = Vec::new();
    let mut total = 0usize;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(malformed)?;

        let wanted = limits.fields.contains(&field.name().unwrap_or_default());
        if wanted && uploads.len() == limits.max_files {
            return Err(ApiError::validation(format!(
                "Maximum {} images per request",
                limits.max_files
            )));
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();
        let content_type = field.content_type().map(|m| m.to_string());

        let mut bytes = Vec::new();
        let mut size = 0;
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(malformed)?;
            size += chunk.len();
            total += chunk.len();
            if wanted {
                if size <= limits.max_file_size {
                    bytes.extend_from_slice(&chunk);
                } else if limits.fail_fast {
                    return Err(ApiError::PayloadTooLarge(format!(
                        "File {} exceeds the maximum size of {} bytes",
                        filename, limits.max_file_size
                    )));
                } else if !bytes.is_empty() {
                    bytes = Vec::new();
                }
            }
            if total > max_total {
                return Err(ApiError::PayloadTooLarge(format!(
                    "Request body exceeds {max_total} bytes"
                )));
            }
        }

        if wanted {
            uploads.push(Upload {
                filename,
                content_type,
                bytes,
                size,
            });
        }
    }

    Ok(uploads)
}

/// Checks that run before any decoding or model call.
fn validate_upload(upload: &Upload, state: &AppState) -> Result<(), ApiError> {
    let max_size = state.settings.max_file_size;
    if upload.size == 0 {
        return Err(ApiError::validation(format!(
            "Uploaded file {} is empty",
            upload.filename
        )));
    }
    if upload.size > max_size {
        return Err(ApiError::PayloadTooLarge(format!(
            "File {} is {} bytes, maximum is {} bytes",
            upload.filename, upload.size, max_size
        )));
    }
    let content_type = upload.content_type.as_deref().unwrap_or("unknown");
    if !state.preprocessor.accepts_content_type(content_type) {
        return Err(ApiError::validation(format!(
            "Invalid file type: {content_type}. Only JPEG and PNG are supported."
        )));
    }
    Ok(())
}

/// Decode, preprocess and classify one validated upload. CPU bound, run it
/// on the blocking pool.
fn classify(
    preprocessor: &Preprocessor,
    model: &ModelWrapper,
    upload: Upload,
    top_k: usize,
) -> Result<PredictionResult, ApiError> {
    let image = preprocessor.decode(&upload.bytes, upload.content_type.as_deref())?;
    log::info!(
        "Processing image: {} - Size: {:?}",
        upload.filename,
        image.dimensions()
    );

    let tensor = preprocessor.preprocess(&image);
    let probabilities = model.predict(&tensor)?;
    let result = PredictionResult::new(upload.filename, probabilities, top_k)
        .ok_or_else(|| ApiError::internal("model returned an empty probability map"))?;

    log::info!(
        "Prediction: {} with confidence {:.4}",
        result.predicted_class,
        result.confidence
    );
    Ok(result)
}

fn classify_batch_item(
    state: &AppState,
    model: &ModelWrapper,
    upload: Upload,
    top_k: usize,
) -> BatchItem {
    let filename = upload.filename.clone();
    let outcome = validate_upload(&upload, state)
        .and_then(|_| classify(&state.preprocessor, model, upload, top_k));
    match outcome {
        Ok(result) => BatchItem::Success(result),
        Err(e) => {
            log::warn!("Batch item {} failed: {}", filename, e);
            BatchItem::Error {
                filename,
                error: e.public_message(),
            }
        }
    }
}
