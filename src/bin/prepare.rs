use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use dlserve::command::{run_command, run_streaming};
use dlserve::config::Config;
use dlserve::filename::{basename, sanitize_filename};
use dlserve::{hub, init_tracing};

const USER_AGENT: &str = "curl/8";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_ATTEMPTS: u32 = 3;
const CLONE_ATTEMPTS: u32 = 2;

/// Python packages the stock host image is missing. `MISSING_PACKAGES`
/// (comma-separated) overrides the list.
const DEFAULT_PACKAGES: &[&str] = &["gguf", "opencv-python-headless"];

fn main() -> Result<()> {
    init_tracing();

    let host_path = PathBuf::from(env::var("HOST_PATH").context("HOST_PATH is not set")?);
    let models_path = optional_env("MODELS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| host_path.join("models"));
    let config = Config::from_env();

    let client = http_client()?;
    let mut background: Vec<JoinHandle<()>> = vec![];

    ensure_host_checkout(&host_path)?;
    install_packages();

    if let Some(url) = optional_env("SETTINGS_URL") {
        background.push(apply_settings(client.clone(), url, host_path.clone()));
    }

    if let Some(url) = optional_env("NODE_LIST_URL") {
        setup_custom_nodes(&client, &url, &host_path, &mut background)?;
    }

    if env_flag("DOWNLOAD_MODELS", true) {
        if let Some(url) = optional_env("DOWNLOAD_LIST_URL") {
            download_models(&client, &config, &url, &models_path)?;
        }
    } else {
        info!("model downloads disabled");
    }

    for handle in background {
        let _ = handle.join();
    }

    info!("environment ready");
    Ok(())
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    flag_value(env::var(name).ok().as_deref(), default)
}

fn flag_value(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("cannot build HTTP client")
}

/// Fetch a small text file, retrying transient failures.
fn fetch_text(client: &reqwest::blocking::Client, url: &str) -> Result<String> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text());

        match result {
            Ok(text) => return Ok(text),
            Err(err) if attempt < FETCH_ATTEMPTS => {
                warn!("fetch attempt {attempt}/{FETCH_ATTEMPTS} failed for {url}: {err}");
            }
            Err(err) => return Err(err).with_context(|| format!("GET {url} failed")),
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    match dest.file_name().and_then(|name| name.to_str()) {
        Some(name) => dest.with_file_name(format!("{name}.part")),
        None => dest.with_file_name("download.part"),
    }
}

/// Download `url` to `dest` in up to `attempts` tries, writing through a
/// `.part` sibling so an interrupted run never leaves a half-written file
/// under the final name.
fn fetch_to_file(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    token: Option<&str>,
    attempts: u32,
) -> Result<()> {
    let part = part_path(dest);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_fetch(client, url, &part, dest, token) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < attempts => {
                warn!("fetch attempt {attempt}/{attempts} failed for {url}: {err:#}");
                let _ = fs::remove_file(&part);
            }
            Err(err) => {
                let _ = fs::remove_file(&part);
                return Err(err);
            }
        }
    }
}

fn try_fetch(
    client: &reqwest::blocking::Client,
    url: &str,
    part: &Path,
    dest: &Path,
    token: Option<&str>,
) -> Result<()> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let mut response = request
        .send()
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("GET {url} failed"))?;

    let mut file =
        fs::File::create(part).with_context(|| format!("cannot open {}", part.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("cannot write {}", part.display()))?;
    drop(file);

    fs::rename(part, dest).with_context(|| format!("cannot move {}", dest.display()))?;
    Ok(())
}

fn ensure_host_checkout(host_path: &Path) -> Result<()> {
    if host_path.is_dir() {
        info!("host checkout present: {}", host_path.display());
        return Ok(());
    }

    let Some(repo) = optional_env("HOST_REPO_URL") else {
        bail!(
            "{} does not exist and HOST_REPO_URL is not set",
            host_path.display()
        );
    };

    clone_repo(&repo, host_path)
}

fn clone_repo(repo: &str, dest: &Path) -> Result<()> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        info!("cloning {repo} (attempt {attempt}/{CLONE_ATTEMPTS})");
        let result = run_command(
            "git",
            vec![
                "clone".to_string(),
                "--depth=1".to_string(),
                "--single-branch".to_string(),
                "--no-tags".to_string(),
                repo.to_string(),
                dest.to_string_lossy().into_owned(),
            ],
            None,
            "git clone",
        );

        match result {
            Ok(_) => return Ok(()),
            Err(err) if attempt < CLONE_ATTEMPTS => {
                warn!("{err}");
                let _ = fs::remove_dir_all(dest);
            }
            Err(err) => return Err(err).with_context(|| format!("cannot clone {repo}")),
        }
    }
}

fn package_list() -> Vec<String> {
    match optional_env("MISSING_PACKAGES") {
        Some(raw) => parse_packages(&raw),
        None => DEFAULT_PACKAGES.iter().map(|name| name.to_string()).collect(),
    }
}

fn parse_packages(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn install_packages() {
    for package in package_list() {
        let result = run_command(
            "python3",
            vec![
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--no-cache-dir".to_string(),
                "-q".to_string(),
                package.clone(),
            ],
            None,
            &format!("pip install {package}"),
        );
        match result {
            Ok(_) => info!("installed {package}"),
            Err(err) => warn!("{err}"),
        }
    }
}

fn apply_settings(
    client: reqwest::blocking::Client,
    url: String,
    host_path: PathBuf,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let dest = host_path.join("user/default/comfy.settings.json");
        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("cannot create {}: {err}", parent.display());
                return;
            }
        }
        match fetch_to_file(&client, &url, &dest, None, FETCH_ATTEMPTS) {
            Ok(()) => info!("settings applied: {}", dest.display()),
            Err(err) => warn!("cannot apply settings: {err:#}"),
        }
    })
}

fn setup_custom_nodes(
    client: &reqwest::blocking::Client,
    url: &str,
    host_path: &Path,
    background: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    let text = fetch_text(client, url).context("cannot fetch node list")?;
    let nodes_dir = host_path.join("custom_nodes");
    fs::create_dir_all(&nodes_dir)
        .with_context(|| format!("cannot create {}", nodes_dir.display()))?;

    for repo in parse_line_list(&text) {
        let dest = nodes_dir.join(repo_dir_name(&repo));
        if dest.is_dir() {
            info!("custom node already present: {}", dest.display());
        } else if let Err(err) = clone_repo(&repo, &dest) {
            warn!("skipping {repo}: {err:#}");
            continue;
        }

        let requirements = dest.join("requirements.txt");
        if requirements.is_file() {
            let result = run_command(
                "python3",
                vec![
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "--no-cache-dir".to_string(),
                    "-q".to_string(),
                    "-r".to_string(),
                    requirements.to_string_lossy().into_owned(),
                ],
                None,
                &format!("pip install requirements for {repo}"),
            );
            if let Err(err) = result {
                warn!("{err}");
            }
        }

        if dest.join("install.py").is_file() {
            background.push(run_installer(dest));
        }
    }

    Ok(())
}

fn run_installer(dir: PathBuf) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("running install.py in {}", dir.display());
        let result = run_streaming(
            "python3",
            vec!["-B".to_string(), "install.py".to_string()],
            Some(&dir),
            "install.py",
        );
        match result {
            Ok(()) => info!("install.py finished in {}", dir.display()),
            Err(err) => warn!("install.py failed in {}: {err}", dir.display()),
        }
    })
}

fn download_models(
    client: &reqwest::blocking::Client,
    config: &Config,
    url: &str,
    models_path: &Path,
) -> Result<()> {
    let text = fetch_text(client, url).context("cannot fetch download list")?;
    let entries = hub::parse_list(&text);
    info!("download list has {} entries", entries.len());

    let token = (!config.hf_token.is_empty()).then_some(config.hf_token.as_str());

    for entry in &entries {
        let dir = models_path.join(entry.local_subdir.trim_matches('/'));
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!("cannot create {}: {err}", dir.display());
            continue;
        }

        let name = sanitize_filename(basename(&entry.file_in_repo));
        if name.is_empty() {
            warn!("skipping malformed entry: {}", entry.file_in_repo);
            continue;
        }

        let dest = dir.join(&name);
        if dest.exists() {
            info!("already present: {}", dest.display());
            continue;
        }

        let file_url = hub::file_url(&config.hub_base_url, &entry.repo_id, &entry.file_in_repo);
        info!("downloading {file_url} -> {}", dest.display());
        // One attempt per entry; a failed line is reported and skipped.
        if let Err(err) = fetch_to_file(client, &file_url, &dest, token, 1) {
            warn!("cannot download {}: {err:#}", entry.file_in_repo);
        }
    }

    Ok(())
}

fn parse_line_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Directory name a `git clone` of `repo` produces.
fn repo_dir_name(repo: &str) -> String {
    let tail = repo.trim_end_matches('/').rsplit('/').next().unwrap_or(repo);
    tail.trim_end_matches(".git").to_string()
}
