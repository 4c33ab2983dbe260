use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use tracing::warn;

use crate::utils::http::get_http_client;

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn is_image(data: &[u8]) -> bool {
    detect_mime_type(data)
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false)
}

/// File name Telegram shows for an uploaded image.
pub fn image_file_name(data: &[u8]) -> String {
    let extension = match detect_mime_type(data).as_deref() {
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        _ => "png",
    };
    format!("villa.{extension}")
}

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Fetches an image the generation service published by URL, so it can be
/// uploaded even when Telegram cannot reach the service directly.
pub async fn download_image(url: &str) -> Result<Vec<u8>> {
    let client = get_http_client();
    let mut last_error = anyhow!("no download attempts made for {url}");

    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let delay = Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt);
        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch image {url}: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                let retry = should_retry_error(&err);
                last_error = err.into();
                if !retry {
                    break;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Image download failed for {url} with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            last_error = anyhow!("image download failed with status {status}");
            if !should_retry_status(status) {
                break;
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        let bytes = response.bytes().await?.to_vec();
        if !is_image(&bytes) {
            return Err(anyhow!("{url} did not return an image"));
        }
        return Ok(bytes);
    }

    Err(last_error)
}
