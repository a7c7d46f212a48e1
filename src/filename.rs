use std::time::Duration;

use actix_web::http::header;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Replace characters that are unsafe in file names and trim whitespace.
pub fn sanitize_filename(name: &str) -> String {
    let re = Regex::new(r#"[\\/:*?"<>|\x00-\x1F]"#).unwrap();
    re.replace_all(name, "_").trim().to_string()
}

/// Last component of a slash- or backslash-separated path.
pub fn basename(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

/// Extract a file name from a `Content-Disposition` header value. Handles the
/// RFC 5987 `filename*=` form, quoted and bare `filename=` forms.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let extended = Regex::new(r"(?i)filename\*\s*=\s*[^']*''([^;]+)").unwrap();
    let quoted = Regex::new(r#"(?i)filename\s*=\s*"([^"]+)""#).unwrap();
    let bare = Regex::new(r"(?i)filename\s*=\s*([^;]+)").unwrap();

    let raw = if let Some(cap) = extended.captures(value) {
        let encoded = cap.get(1).unwrap().as_str().trim().trim_matches('"');
        percent_decode_str(encoded).decode_utf8_lossy().into_owned()
    } else if let Some(cap) = quoted.captures(value) {
        cap.get(1).unwrap().as_str().to_string()
    } else if let Some(cap) = bare.captures(value) {
        cap.get(1).unwrap().as_str().trim().trim_matches('"').to_string()
    } else {
        return None;
    };

    let name = sanitize_filename(basename(&raw));
    (!name.is_empty()).then_some(name)
}

/// Look for an explicit file name hint in the URL query string. Hosts that
/// serve signed URLs often carry one; when present it wins over everything.
pub fn query_filename(raw_url: &str) -> Option<String> {
    let url = Url::parse(raw_url.trim()).ok()?;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();

    for key in ["filename", "file", "name", "response-content-disposition"] {
        let Some((_, value)) = pairs.iter().find(|(k, _)| k == key) else {
            continue;
        };
        let candidate = if key == "response-content-disposition" {
            match parse_content_disposition(value) {
                Some(name) => name,
                None => continue,
            }
        } else {
            sanitize_filename(basename(value))
        };
        if !candidate.is_empty() {
            return Some(candidate);
        }
    }
    None
}

/// Scheme and authority of `raw_url` with a trailing slash, for use as a
/// `Referer` value. Returns `None` for non-HTTP URLs.
pub fn origin_of(raw_url: &str) -> Option<String> {
    let url = Url::parse(raw_url.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let origin = url.origin().ascii_serialization();
    (origin != "null").then(|| format!("{origin}/"))
}

/// Last URL path segment, percent-decoded and sanitized.
fn path_filename(raw_url: &str) -> Option<String> {
    let url = Url::parse(raw_url.trim()).ok()?;
    let last = url.path_segments()?.last()?;
    let decoded = percent_decode_str(last).decode_utf8_lossy();
    let name = sanitize_filename(&decoded);
    (!name.is_empty()).then_some(name)
}

/// Best-effort guess of the final file name before the transfer starts.
/// Returns the guess and whether it is confident. Confident guesses come from
/// an explicit query hint or a `Content-Disposition` header read via a HEAD
/// probe; the URL path basename is a fallback the server may still override.
pub async fn probe_filename(raw_url: &str, token: Option<&str>) -> (Option<String>, bool) {
    if let Some(name) = query_filename(raw_url) {
        return (Some(name), true);
    }

    if let Some(value) = probe_disposition(raw_url, token).await {
        if let Some(name) = parse_content_disposition(&value) {
            return (Some(name), true);
        }
    }

    (path_filename(raw_url), false)
}

async fn probe_disposition(raw_url: &str, token: Option<&str>) -> Option<String> {
    let client = awc::Client::default();
    let request = |head: bool| {
        let mut req = if head {
            client.head(raw_url)
        } else {
            client.get(raw_url)
        };
        req = req.timeout(PROBE_TIMEOUT);
        if let Some(token) = token {
            req = req.insert_header((header::AUTHORIZATION, format!("Bearer {token}")));
        }
        req
    };

    let resp = request(true).send().await.ok()?;
    // Some hosts refuse HEAD outright; ask again with GET and drop the body.
    let resp = if matches!(resp.status().as_u16(), 403 | 405) {
        request(false).send().await.ok()?
    } else {
        resp
    };

    resp.headers()
        .get(header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()
        .map(str::to_owned)
}
