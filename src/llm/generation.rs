use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::Form;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::media::{detect_mime_type, is_image, truncate_for_log};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_service_timing;

const PROMPT_FIELD: &str = "prompt-text";
const RESOLUTION_FIELD: &str = "resolution";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 500;
// The flow's own deadline must fire before the HTTP one.
const REQUEST_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation service rejected the request: {0}")]
    Rejected(String),
    #[error("generation service unreachable: {0}")]
    Transport(String),
    #[error("generation service returned an unusable payload: {0}")]
    InvalidPayload(String),
    #[error("generation service did not answer in time")]
    TimedOut,
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::TimedOut
        } else {
            GenerationError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationParams {
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Bytes(Vec<u8>),
    Url(String),
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ImageRef, GenerationError>;

    async fn is_online(&self) -> bool;
}

/// Client for the Stable Diffusion wrapper service.
pub struct HttpImageGenerator {
    gen_url: String,
    health_url: String,
    request_timeout: Duration,
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim();
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

impl HttpImageGenerator {
    pub fn new(api_url: &str, gen_path: &str, health_path: &str, request_timeout: Duration) -> Self {
        HttpImageGenerator {
            gen_url: join_url(api_url, gen_path),
            health_url: join_url(api_url, health_path),
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        HttpImageGenerator::new(
            &config.generation_api_url,
            &config.generation_gen_path,
            &config.generation_health_path,
            config.generation_timeout() + REQUEST_TIMEOUT_GRACE,
        )
    }

    async fn post_prompt(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ImageRef, GenerationError> {
        let mut form = Form::new().text(PROMPT_FIELD, prompt.to_string());
        if let Some(resolution) = &params.resolution {
            form = form.text(RESOLUTION_FIELD, resolution.clone());
        }

        let response = get_http_client()
            .post(&self.gen_url)
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response.bytes().await?;
        debug!(
            "Generation service answered status={} content_type={:?} bytes={}",
            status,
            content_type,
            body.len()
        );

        interpret_response(status, content_type.as_deref(), &body)
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ImageRef, GenerationError> {
        let metadata = json!({
            "prompt_chars": prompt.chars().count(),
            "resolution": params.resolution,
        });
        log_service_timing("villa_backend", &self.gen_url, "generate", Some(metadata), || {
            self.post_prompt(prompt, params)
        })
        .await
    }

    async fn is_online(&self) -> bool {
        match get_http_client()
            .get(&self.health_url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!("Error checking generation API {}: {}", self.health_url, err);
                false
            }
        }
    }
}

/// Maps the service's HTTP answer onto an image or an explicit failure.
pub fn interpret_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ImageRef, GenerationError> {
    if !status.is_success() {
        let text = String::from_utf8_lossy(body);
        return Err(GenerationError::Rejected(format!(
            "status {}: {}",
            status,
            summarize_error_body(&text)
        )));
    }

    let declared_json = content_type
        .map(|value| value.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    if declared_json || body.first() == Some(&b'{') {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            GenerationError::InvalidPayload(format!("malformed JSON response: {err}"))
        })?;
        return image_from_json(&value);
    }

    if body.is_empty() {
        return Err(GenerationError::InvalidPayload(
            "empty response body".to_string(),
        ));
    }
    match detect_mime_type(body) {
        Some(mime) if mime.starts_with("image/") => Ok(ImageRef::Bytes(body.to_vec())),
        Some(mime) => Err(GenerationError::InvalidPayload(format!(
            "expected an image, got {mime}"
        ))),
        None => Err(GenerationError::InvalidPayload(
            "response body is not a recognizable image".to_string(),
        )),
    }
}

fn image_from_json(value: &Value) -> Result<ImageRef, GenerationError> {
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let message = error
            .as_str()
            .map(|message| message.to_string())
            .or_else(|| {
                error
                    .get("message")
                    .and_then(|message| message.as_str())
                    .map(|message| message.to_string())
            })
            .unwrap_or_else(|| error.to_string());
        return Err(GenerationError::Rejected(message));
    }

    if let Some(url) = value.get("url").and_then(|url| url.as_str()) {
        return Ok(ImageRef::Url(url.to_string()));
    }

    let encoded = value
        .get("image")
        .and_then(|image| image.as_str())
        .or_else(|| {
            value
                .get("images")
                .and_then(|images| images.get(0))
                .and_then(|image| image.as_str())
        });
    let Some(encoded) = encoded else {
        return Err(GenerationError::InvalidPayload(
            "JSON response carries no image".to_string(),
        ));
    };

    let data = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded,
    };
    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| GenerationError::InvalidPayload(format!("invalid base64 image: {err}")))?;
    if !is_image(&bytes) {
        return Err(GenerationError::InvalidPayload(
            "decoded payload is not an image".to_string(),
        ));
    }
    Ok(ImageRef::Bytes(bytes))
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .or_else(|| value.get("error").and_then(|v| v.as_str()))
            .or_else(|| value.get("message").and_then(|v| v.as_str()));
        if let Some(message) = message {
            return truncate_for_log(message, ERROR_BODY_LIMIT);
        }
        return truncate_for_log(&value.to_string(), ERROR_BODY_LIMIT);
    }

    truncate_for_log(trimmed, ERROR_BODY_LIMIT)
}

/// Base URL of a local listener that accepts connections and never answers.
#[cfg(test)]
pub(crate) fn silent_service_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("local listener address");
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 16] = [
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R',
    ];

    #[test]
    fn joins_base_url_and_paths() {
        assert_eq!(join_url("http://sd:5000/", "/gen"), "http://sd:5000/gen");
        assert_eq!(join_url("http://sd:5000", "gen"), "http://sd:5000/gen");
        assert_eq!(join_url("http://sd:5000", ""), "http://sd:5000");
    }

    #[test]
    fn raw_image_body_is_returned_as_bytes() {
        let result = interpret_response(StatusCode::OK, Some("image/png"), &PNG_HEADER);
        assert_eq!(result.unwrap(), ImageRef::Bytes(PNG_HEADER.to_vec()));
    }

    #[test]
    fn json_url_and_base64_payloads_are_understood() {
        let url = interpret_response(
            StatusCode::OK,
            Some("application/json"),
            br#"{"url": "https://cdn.test/villa.png"}"#,
        );
        assert_eq!(url.unwrap(), ImageRef::Url("https://cdn.test/villa.png".to_string()));

        let encoded = general_purpose::STANDARD.encode(PNG_HEADER);
        let body = format!(r#"{{"images": ["data:image/png;base64,{encoded}"]}}"#);
        let bytes = interpret_response(StatusCode::OK, None, body.as_bytes());
        assert_eq!(bytes.unwrap(), ImageRef::Bytes(PNG_HEADER.to_vec()));
    }

    #[test]
    fn json_error_payload_is_an_explicit_failure() {
        let result = interpret_response(
            StatusCode::OK,
            Some("application/json; charset=utf-8"),
            br#"{"error": "CUDA out of memory"}"#,
        );
        match result {
            Err(GenerationError::Rejected(message)) => assert_eq!(message, "CUDA out of memory"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn non_success_status_carries_the_body_summary() {
        let result = interpret_response(
            StatusCode::SERVICE_UNAVAILABLE,
            Some("application/json"),
            br#"{"message": "queue full"}"#,
        );
        match result {
            Err(GenerationError::Rejected(message)) => {
                assert!(message.contains("503"));
                assert!(message.contains("queue full"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn garbage_bodies_are_invalid_payloads() {
        assert!(matches!(
            interpret_response(StatusCode::OK, Some("text/plain"), b"all good"),
            Err(GenerationError::InvalidPayload(_))
        ));
        assert!(matches!(
            interpret_response(StatusCode::OK, None, b""),
            Err(GenerationError::InvalidPayload(_))
        ));
        assert!(matches!(
            interpret_response(StatusCode::OK, Some("application/json"), b"{\"status\": \"ok\"}"),
            Err(GenerationError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn silent_service_is_a_timeout_not_a_transport_error() {
        let generator = HttpImageGenerator::new(
            &silent_service_url(),
            "/gen",
            "/prompts",
            Duration::from_millis(200),
        );
        let result = generator
            .generate("Modern villa at Urban", &GenerationParams::default())
            .await;
        assert!(matches!(result, Err(GenerationError::TimedOut)), "{result:?}");
    }
}
