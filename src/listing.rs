use actix_web::{get, web, Responder, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

#[derive(Deserialize)]
struct ListDirQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct ListDirResponse {
    ok: bool,
    root: String,
    folders: Vec<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(listdir);
}

/// Immediate subdirectories of a path, for destination pickers. A file path
/// lists its parent directory; a blank path lists nothing.
#[get("/fs/listdir")]
async fn listdir(query: web::Query<ListDirQuery>) -> Result<impl Responder> {
    let raw = query.path.as_deref().map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Ok(web::Json(ListDirResponse {
            ok: true,
            root: String::new(),
            folders: vec![],
        }));
    }

    let base = paths::safe_expand(raw);
    let root = match tokio::fs::metadata(&base).await {
        Ok(meta) if meta.is_dir() => base,
        _ => match base.parent() {
            Some(parent) => parent.to_path_buf(),
            None => base,
        },
    };

    let mut folders: Vec<String> = vec![];
    if let Ok(mut entries) = tokio::fs::read_dir(&root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(kind) = entry.file_type().await {
                if kind.is_dir() {
                    folders.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
    }
    folders.sort();

    Ok(web::Json(ListDirResponse {
        ok: true,
        root: root.to_string_lossy().replace('\\', "/"),
        folders,
    }))
}
