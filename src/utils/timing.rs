use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::info;

/// Wraps an external service call with `bot.timing` request/response events.
pub async fn log_service_timing<T, E, F, Fut>(
    service: &str,
    endpoint: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: "bot.timing",
        "event=service_request service={} endpoint={} operation={} started_at={} metadata={}",
        service,
        endpoint,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let (status, detail) = match &result {
        Ok(_) => ("success", String::new()),
        Err(err) => ("error", err.to_string()),
    };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: "bot.timing",
        "event=service_response service={} endpoint={} operation={} completed_at={} duration_s={:.3} status={} detail={:?} metadata={}",
        service,
        endpoint,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status,
        detail,
        metadata_text
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_results_through() {
        let ok: Result<u8, String> =
            log_service_timing("test", "local", "ok", None, || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u8, String> = log_service_timing("test", "local", "err", None, || async {
            Err("boom".to_string())
        })
        .await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
