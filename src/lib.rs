use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod command;
pub mod config;
pub mod download;
pub mod filename;
pub mod hub;
pub mod listing;
pub mod models;
pub mod nodes;
pub mod paths;
pub mod tokens;
pub mod upload;
pub mod web;

static TRACING: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
            )
            .init();
    });
}
