use std::env;

use actix_web::{http::StatusCode, web, App, HttpResponse, HttpServer};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::models::JobTable;
use crate::{download, hub, listing, tokens, upload};

/// Shared application state handed to every handler.
pub struct AppState {
    pub config: Config,
    pub jobs: JobTable,
    /// Pooled client used by transfer workers.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            jobs: JobTable::new(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// JSON error body in the shape `{"error": "..."}` shared by every route.
pub fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: message.to_owned(),
    })
}

/// Mount every route group. Tests reuse this to build the same app.
pub fn app_config(cfg: &mut web::ServiceConfig) {
    download::configure(cfg);
    hub::configure(cfg);
    listing::configure(cfg);
    upload::configure(cfg);
    tokens::configure(cfg);
}

fn get_port() -> u16 {
    env::var("PORT")
        .map_err(|_| ())
        .and_then(|string| string.parse::<u16>().map_err(|_| ()))
        .unwrap_or(3900)
}

pub async fn start_web_server(config: Config) -> std::io::Result<()> {
    let app_state = web::Data::new(AppState::new(config));
    let port = get_port();

    info!("starting web server at 0.0.0.0:{port}...");

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(app_config))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}
