use actix_web::{get, web, Responder, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::web::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Hf,
    Civitai,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Hf => "hf",
            TokenKind::Civitai => "civitai",
        }
    }
}

/// Which configured credential applies to `raw_url`, decided by the URL host
/// rather than a substring match so query strings cannot spoof it.
pub fn kind_for_url(raw_url: &str) -> Option<TokenKind> {
    let url = Url::parse(raw_url.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();

    if host == "huggingface.co"
        || host.ends_with(".huggingface.co")
        || host == "hf.co"
        || host.ends_with(".hf.co")
    {
        Some(TokenKind::Hf)
    } else if host == "civitai.com" || host.ends_with(".civitai.com") {
        Some(TokenKind::Civitai)
    } else {
        None
    }
}

/// The configured token for `raw_url`, if the host matches one and the token
/// is non-empty.
pub fn token_for_url(config: &Config, raw_url: &str) -> Option<String> {
    let token = match kind_for_url(raw_url)? {
        TokenKind::Hf => &config.hf_token,
        TokenKind::Civitai => &config.civitai_token,
    };
    (!token.is_empty()).then(|| token.clone())
}

fn masked_suffix(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = token.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("...{tail}")
}

#[derive(Serialize)]
struct TokenSummary {
    hf: String,
    civitai: String,
}

#[derive(Deserialize)]
struct ResolveQuery {
    url: Option<String>,
}

#[derive(Serialize)]
struct ResolveResponse {
    token: String,
    kind: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(summary).service(resolve);
}

/// Masked view of the configured tokens, safe to show in a UI.
#[get("/tokens")]
async fn summary(data: web::Data<AppState>) -> Result<impl Responder> {
    Ok(web::Json(TokenSummary {
        hf: masked_suffix(&data.config.hf_token),
        civitai: masked_suffix(&data.config.civitai_token),
    }))
}

/// Full token for a URL, for clients that prefill credential fields.
#[get("/tokens/resolve")]
async fn resolve(
    data: web::Data<AppState>,
    query: web::Query<ResolveQuery>,
) -> Result<impl Responder> {
    let url = query.url.clone().unwrap_or_default();
    Ok(web::Json(ResolveResponse {
        token: token_for_url(&data.config, &url).unwrap_or_default(),
        kind: kind_for_url(&url)
            .map(|kind| kind.as_str().to_owned())
            .unwrap_or_default(),
    }))
}
