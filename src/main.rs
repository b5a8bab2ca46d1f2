use actix_cors::Cors;
use actix_web::dev::Service;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{middleware, web, App, HttpServer};
use std::io;
use std::time::Instant;

use scene_backend::config::Settings;
use scene_backend::model::ModelWrapper;
use scene_backend::{handlers, logging, AppState};

const PROCESS_TIME_HEADER: &str = "x-process-time";

fn cors(allowed_origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);
    if allowed_origins.iter().any(|o| o == "*") {
        cors.allow_any_origin()
    } else {
        allowed_origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let settings =
        Settings::load().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    logging::init(&settings)?;

    log::info!("Starting {} v{}", settings.api_title, settings.api_version);
    log::info!("Loading model and preprocessor...");
    let model = match ModelWrapper::load(&settings) {
        Ok(model) => Some(model),
        Err(e) => {
            log::error!("Failed to load model: {}", e);
            log::warn!("Model not loaded, prediction endpoints will answer 503");
            None
        }
    };

    let static_dir = if settings.static_dir.is_dir() {
        Some(settings.static_dir.clone())
    } else {
        log::warn!(
            "Static directory {} not found, frontend disabled",
            settings.static_dir.display()
        );
        None
    };

    let bind_address = settings.bind_address();
    let state = web::Data::new(AppState::new(settings, model));

    log::info!("Starting server on {}", bind_address);
    HttpServer::new(move || {
        App::new()
            .wrap_fn(|req, srv| {
                let started = Instant::now();
                let fut = srv.call(req);
                async move {
                    let mut res = fut.await?;
                    let elapsed = format!("{:.6}", started.elapsed().as_secs_f64());
                    if let Ok(value) = HeaderValue::from_str(&elapsed) {
                        res.headers_mut()
                            .insert(HeaderName::from_static(PROCESS_TIME_HEADER), value);
                    }
                    Ok(res)
                }
            })
            .wrap(middleware::Logger::new("%a \"%r\" %s %b %Ts"))
            .wrap(cors(&state.settings.allowed_origins))
            .app_data(state.clone())
            .configure(|cfg| handlers::configure_routes(cfg, static_dir.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await?;

    log::info!("Shutting down application...");
    Ok(())
}
