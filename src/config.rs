use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default hub base; override with `HUB_BASE_URL` (useful for mirrors and tests).
const DEFAULT_HUB_BASE_URL: &str = "https://huggingface.co";

const DEFAULT_EXPIRE_JOBS_AFTER: Duration = Duration::from_secs(60 * 60);

/// Runtime configuration, read once from the environment at startup and kept
/// in shared application state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hub read token, sent as a bearer credential for hub downloads.
    pub hf_token: String,
    /// Civitai API token.
    pub civitai_token: String,
    /// Root directory that hub fetches place files under.
    pub models_path: PathBuf,
    /// Base URL files in hub repos resolve against.
    pub hub_base_url: String,
    /// How long terminal job records stay visible before the sweep evicts them.
    pub expire_jobs_after: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            hf_token: env::var("HF_TOKEN").unwrap_or_default(),
            civitai_token: env::var("CIVITAI_TOKEN").unwrap_or_default(),
            models_path: env::var("MODELS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./models")),
            hub_base_url: env::var("HUB_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HUB_BASE_URL.to_owned()),
            expire_jobs_after: env::var("EXPIRE_JOBS_AFTER")
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_EXPIRE_JOBS_AFTER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_without_env() {
        // Only assert on the fields no test environment is expected to set.
        let config = Config::from_env();
        assert!(!config.hub_base_url.is_empty());
        assert!(config.expire_jobs_after > Duration::ZERO);
    }
}
