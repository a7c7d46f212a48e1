use actix_web::{get, http::StatusCode, post, web, HttpResponse, Responder, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::filename::{basename, sanitize_filename};
use crate::paths;
use crate::web::{error_response, AppState};

const DEFAULT_LIST_FILE: &str = "download_list.txt";

/// Everything except unreserved characters and `/` gets percent-encoded when
/// a repo file path is placed into a URL.
const PATH_CHARS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub repo_id: String,
    pub file_in_repo: String,
    pub local_subdir: String,
}

/// Parse a download list: one `repo_id, file_in_repo, local_subdir` triple per
/// line. Blank lines, `#` comments and incomplete lines are skipped.
pub fn parse_list(text: &str) -> Vec<ListEntry> {
    let mut entries = vec![];

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(3, ',').map(str::trim);
        let (Some(repo_id), Some(file_in_repo), Some(local_subdir)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if repo_id.is_empty() || file_in_repo.is_empty() || local_subdir.is_empty() {
            continue;
        }

        entries.push(ListEntry {
            repo_id: repo_id.to_string(),
            file_in_repo: file_in_repo.to_string(),
            local_subdir: local_subdir.to_string(),
        });
    }

    entries
}

/// Direct download URL for a file in a hub repo, resolved against `main`.
pub fn file_url(base: &str, repo_id: &str, file_in_repo: &str) -> String {
    let base = base.trim_end_matches('/');
    let repo = utf8_percent_encode(repo_id.trim_matches('/'), PATH_CHARS);
    let file = utf8_percent_encode(file_in_repo.trim_matches('/'), PATH_CHARS);
    format!("{base}/{repo}/resolve/main/{file}")
}

#[derive(Deserialize)]
struct ListQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct ListItem {
    id: usize,
    repo_id: String,
    file_in_repo: String,
    local_subdir: String,
}

#[derive(Serialize)]
struct ListResponse {
    ok: bool,
    path: String,
    total: usize,
    items: Vec<ListItem>,
}

#[derive(Deserialize)]
struct FetchParams {
    repo_id: String,
    file_in_repo: String,
    local_subdir: String,
}

#[derive(Serialize)]
struct FetchResponse {
    ok: bool,
    repo_id: String,
    file_in_repo: String,
    local_subdir: String,
    dst: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list).service(fetch);
}

#[get("/hub/list")]
async fn list(query: web::Query<ListQuery>) -> Result<impl Responder> {
    let raw = query
        .path
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .unwrap_or(DEFAULT_LIST_FILE);
    let path = paths::safe_expand(raw);

    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                &format!("list file not found: {}", path.display()),
            ));
        }
        Err(err) => {
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("cannot read list file: {err}"),
            ));
        }
    };

    let items: Vec<ListItem> = parse_list(&text)
        .into_iter()
        .enumerate()
        .map(|(index, entry)| ListItem {
            id: index + 1,
            repo_id: entry.repo_id,
            file_in_repo: entry.file_in_repo,
            local_subdir: entry.local_subdir,
        })
        .collect();

    Ok(HttpResponse::Ok().json(ListResponse {
        ok: true,
        path: path.to_string_lossy().into_owned(),
        total: items.len(),
        items,
    }))
}

/// Fetch one list entry into the configured models tree. Runs inline; list
/// fetches are driven one entry at a time by the client.
#[post("/hub/fetch")]
async fn fetch(
    data: web::Data<AppState>,
    params: web::Json<FetchParams>,
) -> Result<impl Responder> {
    let repo_id = params.repo_id.trim();
    let file_in_repo = params.file_in_repo.trim();
    let local_subdir = params.local_subdir.trim();

    let file_name = sanitize_filename(basename(file_in_repo));
    if repo_id.is_empty() || file_in_repo.is_empty() || local_subdir.is_empty() || file_name.is_empty()
    {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "invalid or incomplete line data",
        ));
    }

    let target_dir = data.config.models_path.join(local_subdir.trim_matches('/'));
    if let Err(err) = paths::ensure_writable_dir(&target_dir).await {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("destination is not writable: {err}"),
        ));
    }

    let url = file_url(&data.config.hub_base_url, repo_id, file_in_repo);
    info!("hub fetch: {url}");

    let mut request = data.http.get(&url);
    if !data.config.hf_token.is_empty() {
        request = request.bearer_auth(&data.config.hf_token);
    }

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream request failed: {err}"),
            ));
        }
    };
    if !response.status().is_success() {
        return Ok(error_response(
            StatusCode::BAD_GATEWAY,
            &format!("upstream returned {}", response.status()),
        ));
    }

    let final_path = target_dir.join(&file_name);
    let part_path = target_dir.join(format!("{file_name}.part"));

    let mut file = match tokio::fs::File::create(&part_path).await {
        Ok(file) => file,
        Err(err) => {
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("cannot open {}: {err}", part_path.display()),
            ));
        }
    };

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                if let Err(err) = file.write_all(&bytes).await {
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("cannot write {}: {err}", part_path.display()),
                    ));
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("download failed: {err}"),
                ));
            }
        }
    }

    if let Err(err) = file.flush().await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("cannot write {}: {err}", part_path.display()),
        ));
    }
    drop(file);

    if let Err(err) = tokio::fs::rename(&part_path, &final_path).await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("cannot move {}: {err}", final_path.display()),
        ));
    }

    info!("hub fetch complete: {}", final_path.display());

    Ok(HttpResponse::Ok().json(FetchResponse {
        ok: true,
        repo_id: repo_id.to_string(),
        file_in_repo: file_in_repo.to_string(),
        local_subdir: local_subdir.to_string(),
        dst: final_path.to_string_lossy().into_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_comments_and_blanks() {
        let text = "\
# models to pull
org/repo-a, unet/model.safetensors, checkpoints

org/repo-b, vae/decoder.pt, vae
";
        let entries = parse_list(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].repo_id, "org/repo-a");
        assert_eq!(entries[0].file_in_repo, "unet/model.safetensors");
        assert_eq!(entries[0].local_subdir, "checkpoints");
        assert_eq!(entries[1].repo_id, "org/repo-b");
    }

    #[test]
    fn test_parse_list_skips_incomplete_lines() {
        let text = "only-two, fields\n, missing/repo, sub\norg/repo, file.bin, \n";
        assert!(parse_list(text).is_empty());
    }

    #[test]
    fn test_parse_list_keeps_commas_in_subdir() {
        // Only the first two commas split; the rest belong to the subdir.
        let entries = parse_list("org/repo, file.bin, a,b");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_subdir, "a,b");
    }

    #[test]
    fn test_file_url_encodes_path() {
        assert_eq!(
            file_url("https://huggingface.co", "org/repo", "unet/model v2.safetensors"),
            "https://huggingface.co/org/repo/resolve/main/unet/model%20v2.safetensors"
        );
        // Trailing slash on the base and stray slashes on parts are tolerated.
        assert_eq!(
            file_url("http://127.0.0.1:9000/", "org/repo", "/file.bin"),
            "http://127.0.0.1:9000/org/repo/resolve/main/file.bin"
        );
    }
}
