use std::path::Path;
use std::time::Duration;

use actix_web::{test, web, App};
use serde_json::Value;

use dlserve::config::Config;
use dlserve::web::{app_config, AppState};

const BOUNDARY: &str = "X-UPLOAD-TEST-BOUNDARY";

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!(
                        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                    )
                    .as_bytes(),
                );
            }
            Part::File(name, filename, data) => {
                body.extend_from_slice(
                    format!(
                        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(parts: &[Part]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/fs/upload")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body(parts))
}

fn test_config(models_path: &Path, hf_token: &str, civitai_token: &str) -> Config {
    Config {
        hf_token: hf_token.to_string(),
        civitai_token: civitai_token.to_string(),
        models_path: models_path.to_path_buf(),
        hub_base_url: "http://unused".to_string(),
        expire_jobs_after: Duration::from_secs(3600),
    }
}

macro_rules! test_app {
    ($config:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new($config)))
                .configure(app_config),
        )
        .await
    };
}

#[actix_web::test]
async fn test_upload_writes_exact_bytes() {
    let models = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
    let req = upload_request(&[
        Part::Text("dest_dir", dest.path().to_str().unwrap()),
        Part::File("file", "weights.bin", &data),
    ])
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["filename"], "weights.bin");
    assert_eq!(body["bytes"].as_u64().unwrap(), data.len() as u64);

    let written = std::fs::read(dest.path().join("weights.bin")).unwrap();
    assert_eq!(written, data);
}

#[actix_web::test]
async fn test_upload_accepts_any_field_order() {
    let models = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    // File part arrives before the destination is known.
    let req = upload_request(&[
        Part::File("file", "notes.txt", b"hello world"),
        Part::Text("dest_dir", dest.path().to_str().unwrap()),
    ])
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let written = std::fs::read(dest.path().join("notes.txt")).unwrap();
    assert_eq!(written, b"hello world");
}

#[actix_web::test]
async fn test_upload_without_file_is_rejected() {
    let models = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let req =
        upload_request(&[Part::Text("dest_dir", dest.path().to_str().unwrap())]).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "no file part provided");
}

#[actix_web::test]
async fn test_upload_sanitizes_hostile_filenames() {
    let models = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let req = upload_request(&[
        Part::Text("dest_dir", dest.path().to_str().unwrap()),
        Part::File("file", "../../evil:name.bin", b"payload"),
    ])
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["filename"], "evil_name.bin");
    assert!(dest.path().join("evil_name.bin").is_file());
    // Nothing escaped the destination directory.
    assert!(!dest.path().parent().unwrap().join("evil_name.bin").exists());
}

#[actix_web::test]
async fn test_listdir_returns_only_directories_sorted() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let base = tempfile::tempdir().unwrap();
    std::fs::create_dir(base.path().join("beta")).unwrap();
    std::fs::create_dir(base.path().join("alpha")).unwrap();
    std::fs::write(base.path().join("stray.txt"), b"x").unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/fs/listdir?path={}", base.path().display()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["root"].as_str().unwrap(), base.path().to_str().unwrap());
    let folders: Vec<&str> = body["folders"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(folders, vec!["alpha", "beta"]);
}

#[actix_web::test]
async fn test_listdir_blank_path_lists_nothing() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let req = test::TestRequest::get().uri("/fs/listdir").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["root"], "");
    assert!(body["folders"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn test_listdir_file_path_lists_its_parent() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let base = tempfile::tempdir().unwrap();
    std::fs::create_dir(base.path().join("inner")).unwrap();
    let file = base.path().join("model.bin");
    std::fs::write(&file, b"x").unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/fs/listdir?path={}", file.display()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;

    assert_eq!(body["root"].as_str().unwrap(), base.path().to_str().unwrap());
    let folders: Vec<&str> = body["folders"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(folders, vec!["inner"]);
}

#[actix_web::test]
async fn test_tokens_summary_is_masked() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "hf_secretABCD", ""));

    let req = test::TestRequest::get().uri("/tokens").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["hf"], "...ABCD");
    assert_eq!(body["civitai"], "");
}

#[actix_web::test]
async fn test_tokens_resolve_by_host() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "hf_secretABCD", "civ_key9999"));

    let req = test::TestRequest::get()
        .uri("/tokens/resolve?url=https%3A%2F%2Fhuggingface.co%2Forg%2Frepo")
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["token"], "hf_secretABCD");
    assert_eq!(body["kind"], "hf");

    let req = test::TestRequest::get()
        .uri("/tokens/resolve?url=https%3A%2F%2Fcivitai.com%2Fapi%2Fdownload%2Fmodels%2F1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["token"], "civ_key9999");
    assert_eq!(body["kind"], "civitai");

    // A lookalike in the query string must not leak a credential.
    let req = test::TestRequest::get()
        .uri("/tokens/resolve?url=https%3A%2F%2Fexample.com%2F%3Fref%3Dhuggingface.co")
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["token"], "");
    assert_eq!(body["kind"], "");
}

#[actix_web::test]
async fn test_hub_list_parses_file() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let dir = tempfile::tempdir().unwrap();
    let list_path = dir.path().join("download_list.txt");
    std::fs::write(
        &list_path,
        "# curated models\norg/repo-a, unet/model.safetensors, checkpoints\nbroken-line\norg/repo-b, vae/decoder.pt, vae\n",
    )
    .unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/hub/list?path={}", list_path.display()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["total"].as_u64().unwrap(), 2);
    assert_eq!(body["path"].as_str().unwrap(), list_path.to_str().unwrap());

    let items = body["items"].as_array().unwrap();
    assert_eq!(items[0]["id"].as_u64().unwrap(), 1);
    assert_eq!(items[0]["repo_id"], "org/repo-a");
    assert_eq!(items[0]["file_in_repo"], "unet/model.safetensors");
    assert_eq!(items[0]["local_subdir"], "checkpoints");
    assert_eq!(items[1]["id"].as_u64().unwrap(), 2);
    assert_eq!(items[1]["repo_id"], "org/repo-b");
}

#[actix_web::test]
async fn test_hub_list_missing_file_is_not_found() {
    let models = tempfile::tempdir().unwrap();
    let app = test_app!(test_config(models.path(), "", ""));

    let dir = tempfile::tempdir().unwrap();
    let req = test::TestRequest::get()
        .uri(&format!("/hub/list?path={}/absent.txt", dir.path().display()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 404);

    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("not found"));
}
