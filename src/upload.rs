use std::env;
use std::path::{Path, PathBuf};

use actix_multipart::{Field, Multipart};
use actix_web::{http::StatusCode, post, web, HttpResponse, Responder, Result};
use futures::TryStreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::filename::{basename, sanitize_filename};
use crate::paths;
use crate::web::error_response;

const DEFAULT_UPLOAD_DIR: &str = "./uploads";
const FALLBACK_UPLOAD_NAME: &str = "upload.bin";

struct Spool {
    tmp_path: PathBuf,
    original_name: Option<String>,
    bytes: u64,
}

#[derive(Serialize)]
struct UploadResponse {
    ok: bool,
    filename: String,
    path: String,
    bytes: u64,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(upload);
}

/// Accept a `file` part plus an optional `dest_dir` text part, in any order.
/// The file is spooled to a temporary location and only moved into place once
/// the destination is known and validated.
#[post("/fs/upload")]
async fn upload(mut payload: Multipart) -> Result<impl Responder> {
    let (dest_raw, spool) = match collect_parts(&mut payload).await {
        Ok(parts) => parts,
        Err((status, message)) => return Ok(error_response(status, &message)),
    };

    let Some(spool) = spool else {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "no file part provided",
        ));
    };

    let dest_dir = match dest_raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => paths::safe_expand(raw),
        None => paths::safe_expand(DEFAULT_UPLOAD_DIR),
    };

    if let Err(err) = paths::ensure_writable_dir(&dest_dir).await {
        let _ = tokio::fs::remove_file(&spool.tmp_path).await;
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("destination is not writable: {err}"),
        ));
    }

    let file_name = spool
        .original_name
        .as_deref()
        .map(|name| sanitize_filename(basename(name)))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_UPLOAD_NAME.to_string());

    let final_path = dest_dir.join(&file_name);
    if let Err(err) = move_into_place(&spool.tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&spool.tmp_path).await;
        return Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("cannot move {}: {err}", final_path.display()),
        ));
    }

    info!("upload complete: {} ({} bytes)", final_path.display(), spool.bytes);

    Ok(HttpResponse::Ok().json(UploadResponse {
        ok: true,
        filename: file_name,
        path: final_path.to_string_lossy().into_owned(),
        bytes: spool.bytes,
    }))
}

async fn collect_parts(
    payload: &mut Multipart,
) -> std::result::Result<(Option<String>, Option<Spool>), (StatusCode, String)> {
    let mut dest_raw = None;
    let mut spool: Option<Spool> = None;

    loop {
        let field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                if let Some(old) = spool.take() {
                    let _ = tokio::fs::remove_file(&old.tmp_path).await;
                }
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart payload: {err}"),
                ));
            }
        };

        let field_name = field
            .content_disposition()
            .get_name()
            .unwrap_or("")
            .to_owned();

        match field_name.as_str() {
            "dest_dir" => match read_text(field).await {
                Ok(text) => dest_raw = Some(text),
                Err(message) => {
                    if let Some(old) = spool.take() {
                        let _ = tokio::fs::remove_file(&old.tmp_path).await;
                    }
                    return Err((StatusCode::BAD_REQUEST, message));
                }
            },
            "file" => {
                let original_name = field
                    .content_disposition()
                    .get_filename()
                    .map(str::to_owned);
                // If a client sends several file parts, the last one wins.
                if let Some(old) = spool.take() {
                    let _ = tokio::fs::remove_file(&old.tmp_path).await;
                }
                match spool_to_temp(field).await {
                    Ok((tmp_path, bytes)) => {
                        spool = Some(Spool {
                            tmp_path,
                            original_name,
                            bytes,
                        });
                    }
                    Err(failure) => return Err(failure),
                }
            }
            _ => {
                if let Err(message) = drain(field).await {
                    if let Some(old) = spool.take() {
                        let _ = tokio::fs::remove_file(&old.tmp_path).await;
                    }
                    return Err((StatusCode::BAD_REQUEST, message));
                }
            }
        }
    }

    Ok((dest_raw, spool))
}

async fn read_text(mut field: Field) -> std::result::Result<String, String> {
    let mut data = web::BytesMut::new();
    while let Some(chunk) = field
        .try_next()
        .await
        .map_err(|err| format!("malformed multipart payload: {err}"))?
    {
        data.extend_from_slice(&chunk);
    }
    String::from_utf8(data.to_vec()).map_err(|_| "dest_dir is not valid UTF-8".to_string())
}

async fn spool_to_temp(mut field: Field) -> std::result::Result<(PathBuf, u64), (StatusCode, String)> {
    let tmp_path = env::temp_dir().join(format!("upload-{}.part", Uuid::new_v4()));
    let mut file = match tokio::fs::File::create(&tmp_path).await {
        Ok(file) => file,
        Err(err) => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot open {}: {err}", tmp_path.display()),
            ));
        }
    };

    let mut bytes: u64 = 0;
    loop {
        match field.try_next().await {
            Ok(Some(chunk)) => {
                if let Err(err) = file.write_all(&chunk).await {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("cannot write {}: {err}", tmp_path.display()),
                    ));
                }
                bytes += chunk.len() as u64;
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart payload: {err}"),
                ));
            }
        }
    }

    if let Err(err) = file.flush().await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("cannot write {}: {err}", tmp_path.display()),
        ));
    }

    Ok((tmp_path, bytes))
}

async fn drain(mut field: Field) -> std::result::Result<(), String> {
    while field
        .try_next()
        .await
        .map_err(|err| format!("malformed multipart payload: {err}"))?
        .is_some()
    {}
    Ok(())
}

async fn move_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        // The temp dir may sit on a different filesystem.
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
