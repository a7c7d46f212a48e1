use std::env;
use std::path::PathBuf;
use std::time::Instant;

use actix_web::{get, http::StatusCode, post, web, HttpResponse, Responder, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::filename;
use crate::models::{Job, JobState};
use crate::paths;
use crate::tokens;
use crate::web::{error_response, AppState};

#[derive(Deserialize)]
struct StartParams {
    url: String,
    dest_dir: Option<String>,
    filename: Option<String>,
    token: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    id: String,
    dest_dir: String,
    filename: Option<String>,
    confident: bool,
}

#[derive(Deserialize)]
struct StatusQuery {
    id: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    status: JobState,
    percent: f64,
    total_bytes: Option<u64>,
    downloaded_bytes: u64,
    speed: u64,
    eta: Option<u64>,
    filename: Option<String>,
    filepath: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StopParams {
    id: String,
}

#[derive(Serialize)]
struct StopResponse {
    ok: bool,
    id: String,
    status: JobState,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(start_download).service(status).service(stop);
}

// Named `start_download` rather than `start`: the route macro emits a unit
// struct with the handler's name, and a module-scope `start` item collides
// with a binding inside `tokio::select!`'s expansion.
#[post("/dl/start")]
async fn start_download(
    data: web::Data<AppState>,
    params: web::Json<StartParams>,
) -> Result<impl Responder> {
    let url = params.url.trim().to_string();
    if url.is_empty() {
        return Ok(error_response(StatusCode::BAD_REQUEST, "url is required"));
    }

    let dest_dir = match params
        .dest_dir
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
    {
        Some(raw) => paths::safe_expand(raw),
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    if let Err(err) = paths::ensure_writable_dir(&dest_dir).await {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("destination is not writable: {err}"),
        ));
    }

    let token = params
        .token
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_owned)
        .or_else(|| tokens::token_for_url(&data.config, &url));

    // An explicit name in the request wins over every guessing strategy.
    let explicit = params
        .filename
        .as_deref()
        .map(|raw| filename::sanitize_filename(filename::basename(raw)))
        .filter(|name| !name.is_empty());
    let (guess, confident) = match explicit {
        Some(name) => (Some(name), true),
        None => filename::probe_filename(&url, token.as_deref()).await,
    };

    let id = Uuid::new_v4();
    let job = Job::new(id, url.clone(), dest_dir.clone(), guess.clone(), confident);

    // Insert before spawning so a status poll can never miss the job.
    data.jobs.insert(job);
    info!("[{id}] transfer queued: {url}");

    let worker_data = data.clone();
    tokio::spawn(async move { run_transfer(worker_data, id, token).await });

    Ok(HttpResponse::Ok().json(StartResponse {
        id: id.to_string(),
        dest_dir: dest_dir.to_string_lossy().into_owned(),
        filename: guess,
        confident,
    }))
}

#[get("/dl/status")]
async fn status(
    data: web::Data<AppState>,
    query: web::Query<StatusQuery>,
) -> Result<impl Responder> {
    // Old terminal jobs are evicted before the lookup, so an expired id
    // reads as unknown from here on.
    let removed = data.jobs.sweep_expired(data.config.expire_jobs_after);
    for job in removed {
        // It doesn't matter if this file is here or not.
        if let Some(part) = job.part_path() {
            let _ = tokio::fs::remove_file(part).await;
        }
    }

    let id_raw = match query.id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(error_response(StatusCode::BAD_REQUEST, "id is required")),
    };

    let Ok(id) = Uuid::parse_str(id_raw) else {
        return Ok(error_response(StatusCode::NOT_FOUND, "unknown job id"));
    };

    match data.jobs.get(&id) {
        Some(job) => Ok(HttpResponse::Ok().json(status_body(&job))),
        None => Ok(error_response(StatusCode::NOT_FOUND, "unknown job id")),
    }
}

#[post("/dl/stop")]
async fn stop(data: web::Data<AppState>, params: web::Json<StopParams>) -> Result<impl Responder> {
    let id_raw = params.id.trim();
    if id_raw.is_empty() {
        return Ok(error_response(StatusCode::BAD_REQUEST, "id is required"));
    }

    let Ok(id) = Uuid::parse_str(id_raw) else {
        return Ok(error_response(StatusCode::NOT_FOUND, "unknown job id"));
    };

    match data.jobs.get(&id) {
        Some(job) => {
            if !job.state.is_terminal() {
                job.cancel.cancel();
                info!("[{id}] stop requested");
            }
            Ok(HttpResponse::Ok().json(StopResponse {
                ok: true,
                id: id.to_string(),
                status: job.state,
            }))
        }
        None => Ok(error_response(StatusCode::NOT_FOUND, "unknown job id")),
    }
}

fn status_body(job: &Job) -> StatusResponse {
    StatusResponse {
        id: job.id.to_string(),
        status: job.state,
        percent: percent(job.downloaded_bytes, job.total_bytes, job.state),
        total_bytes: job.total_bytes,
        downloaded_bytes: job.downloaded_bytes,
        speed: job.speed_bps,
        eta: eta(job.downloaded_bytes, job.total_bytes, job.speed_bps),
        filename: job.file_name.clone(),
        filepath: job.file_path().map(|path| path.to_string_lossy().into_owned()),
        error: job.error_message.clone(),
    }
}

fn percent(downloaded: u64, total: Option<u64>, state: JobState) -> f64 {
    match total {
        Some(total) if total > 0 => {
            let pct = downloaded as f64 / total as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        }
        _ if state == JobState::Complete => 100.0,
        _ => 0.0,
    }
}

fn eta(downloaded: u64, total: Option<u64>, speed: u64) -> Option<u64> {
    let total = total?;
    if speed == 0 {
        return None;
    }
    Some(total.saturating_sub(downloaded) / speed)
}

enum TransferEnd {
    Finished { path: PathBuf, bytes: u64 },
    Cancelled { part: Option<PathBuf> },
}

async fn run_transfer(data: web::Data<AppState>, id: Uuid, token: Option<String>) {
    let Some(job) = data.jobs.get(&id) else {
        warn!("[{id}] no such job registered, ignoring");
        return;
    };
    let cancel = job.cancel.clone();

    data.jobs.set_state(&id, JobState::Active, None);
    info!("[{id}] transfer started: {}", job.url);

    match stream_to_dest(&data, &job, token.as_deref(), &cancel).await {
        Ok(TransferEnd::Finished { path, bytes }) => {
            data.jobs.set_state(&id, JobState::Complete, None);
            info!("[{id}] transfer complete: {} ({bytes} bytes)", path.display());
        }
        Ok(TransferEnd::Cancelled { part }) => {
            if let Some(part) = part {
                let _ = tokio::fs::remove_file(&part).await;
            }
            data.jobs.set_state(&id, JobState::Stopped, None);
            info!("[{id}] transfer stopped");
        }
        Err(err) => {
            if let Some(part) = data.jobs.get(&id).and_then(|job| job.part_path()) {
                let _ = tokio::fs::remove_file(&part).await;
            }
            data.jobs.set_state(&id, JobState::Error, Some(err.to_string()));
            warn!("[{id}] transfer failed: {err:#}");
        }
    }
}

async fn stream_to_dest(
    data: &web::Data<AppState>,
    job: &Job,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<TransferEnd> {
    let id = job.id;

    // Resume is only safe when the name was pinned up front, otherwise the
    // partial file may belong to a different response name.
    let mut offset: u64 = 0;
    if job.name_confident {
        if let Some(part) = job.part_path() {
            if let Ok(meta) = tokio::fs::metadata(&part).await {
                offset = meta.len();
            }
        }
    }

    let mut request = data.http.get(&job.url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    if let Some(origin) = filename::origin_of(&job.url) {
        request = request.header(reqwest::header::REFERER, origin);
    }
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }

    let mut response = tokio::select! {
        _ = cancel.cancelled() => {
            return Ok(TransferEnd::Cancelled { part: job.part_path() });
        }
        result = request.send() => result.context("request failed")?,
    };

    let http_status = response.status();
    if !http_status.is_success() {
        bail!("upstream returned {http_status}");
    }

    // A 200 despite our range request means the server restarted from zero.
    if offset > 0 && http_status != reqwest::StatusCode::PARTIAL_CONTENT {
        offset = 0;
    }

    let from_headers = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(filename::parse_content_disposition);

    let resolved = if job.name_confident {
        job.file_name.clone()
    } else {
        from_headers.or_else(|| job.file_name.clone())
    };
    let file_name = resolved.unwrap_or_else(|| format!("download-{id}"));
    data.jobs.set_file_name(&id, file_name.clone());

    let part_path = job.dest_dir.join(format!("{file_name}.part"));
    let final_path = job.dest_dir.join(&file_name);

    let mut file = if offset > 0 {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part_path)
            .await
    } else {
        tokio::fs::File::create(&part_path).await
    }
    .with_context(|| format!("cannot open {}", part_path.display()))?;

    let total = response.content_length().map(|len| len + offset);
    data.jobs.record_progress(&id, offset, total, 0);

    let started = Instant::now();
    let mut downloaded = offset;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = file.flush().await;
                return Ok(TransferEnd::Cancelled { part: Some(part_path) });
            }
            chunk = response.chunk() => chunk.context("read failed")?,
        };

        let Some(bytes) = chunk else { break };

        file.write_all(&bytes)
            .await
            .with_context(|| format!("cannot write {}", part_path.display()))?;
        downloaded += bytes.len() as u64;

        let elapsed = started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.1 {
            ((downloaded - offset) as f64 / elapsed) as u64
        } else {
            0
        };
        data.jobs.record_progress(&id, downloaded, total, speed);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part_path, &final_path)
        .await
        .with_context(|| format!("cannot move {}", final_path.display()))?;
    data.jobs.record_progress(&id, downloaded, total.or(Some(downloaded)), 0);

    Ok(TransferEnd::Finished {
        path: final_path,
        bytes: downloaded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_with_known_total() {
        assert_eq!(percent(0, Some(200), JobState::Active), 0.0);
        assert_eq!(percent(50, Some(200), JobState::Active), 25.0);
        assert_eq!(percent(200, Some(200), JobState::Complete), 100.0);
        // Two decimal places, not more.
        assert_eq!(percent(1, Some(3), JobState::Active), 33.33);
    }

    #[test]
    fn test_percent_with_unknown_total() {
        assert_eq!(percent(512, None, JobState::Active), 0.0);
        assert_eq!(percent(512, None, JobState::Complete), 100.0);
        assert_eq!(percent(0, Some(0), JobState::Error), 0.0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta(0, Some(1000), 100), Some(10));
        assert_eq!(eta(900, Some(1000), 100), Some(1));
        // Already past the total: report zero, never underflow.
        assert_eq!(eta(2000, Some(1000), 100), Some(0));
        assert_eq!(eta(0, Some(1000), 0), None);
        assert_eq!(eta(0, None, 100), None);
    }
}
