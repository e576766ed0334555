//! Classified POST execution: one layer above [`HttpTransport`](super::HttpTransport).
//!
//! This module turns a raw transport exchange into the pipeline's failure taxonomy:
//! transport failures become retryable [`LLMError::Transport`] values, non-2xx
//! responses are routed through a failure handler, and handler crashes are wrapped
//! as non-retryable [`LLMError::ResponseProcessing`] carrying status and raw body.

use std::collections::HashMap;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{LLMError, default_http_retryable};

use super::{HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

/// Issues a POST request and classifies the outcome through a handler pair.
///
/// Behavior, in order:
/// 1. Transport failures surface as retryable [`LLMError::Transport`]; cancellation
///    propagates unchanged and drops the in-flight request, aborting it.
/// 2. Non-2xx responses go to `on_failure`, which builds the typed error. If the
///    handler itself fails (malformed error body), the secondary failure is wrapped
///    as non-retryable [`LLMError::ResponseProcessing`].
/// 3. 2xx responses go to `on_success`; handler failures wrap the same way.
///
/// # Errors
///
/// Every failure path yields exactly one taxonomy error; nothing is swallowed.
pub async fn post<T, S, F>(
    transport: &dyn HttpTransport,
    url: &str,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    on_success: S,
    on_failure: F,
    cancel: &CancellationToken,
) -> Result<T, LLMError>
where
    S: FnOnce(&HttpResponse) -> Result<T, LLMError>,
    F: FnOnce(&HttpResponse) -> Result<LLMError, LLMError>,
{
    let request = HttpRequest::post_json(url, body).with_headers(headers);
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(LLMError::aborted("request cancelled in flight"));
        }
        sent = transport.send(request) => sent.map_err(classify_transport_failure)?,
    };

    if response.is_success() {
        on_success(&response).map_err(|err| wrap_handler_failure(err, &response))
    } else {
        match on_failure(&response) {
            Ok(typed) => Err(typed),
            Err(secondary) => Err(wrap_handler_failure(secondary, &response)),
        }
    }
}

/// Issues a streaming POST request, classifying non-2xx responses before any frame
/// is parsed.
///
/// For failure statuses the (possibly streaming) error body is fully collected so
/// `on_failure` sees the same buffered [`HttpResponse`] shape as in [`post`].
pub async fn post_stream<F>(
    transport: &dyn HttpTransport,
    url: &str,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    on_failure: F,
    cancel: &CancellationToken,
) -> Result<HttpStreamResponse, LLMError>
where
    F: FnOnce(&HttpResponse) -> Result<LLMError, LLMError>,
{
    let request = HttpRequest::post_json(url, body).with_headers(headers);
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(LLMError::aborted("request cancelled in flight"));
        }
        sent = transport.send_stream(request) => sent.map_err(classify_transport_failure)?,
    };

    if (200..300).contains(&response.status) {
        return Ok(response);
    }

    let status = response.status;
    let headers = response.headers;
    let body = collect_body(response.body).await?;
    let buffered = HttpResponse {
        status,
        headers,
        body,
    };
    match on_failure(&buffered) {
        Ok(typed) => Err(typed),
        Err(secondary) => Err(wrap_handler_failure(secondary, &buffered)),
    }
}

/// Buffers a body stream, e.g. the error body of a failed streaming request.
pub async fn collect_body(mut body: HttpBodyStream) -> Result<Vec<u8>, LLMError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(bytes)
}

fn classify_transport_failure(err: LLMError) -> LLMError {
    match err {
        LLMError::Transport { .. } | LLMError::Aborted { .. } => err,
        other => LLMError::transport(other.to_string()),
    }
}

fn wrap_handler_failure(err: LLMError, response: &HttpResponse) -> LLMError {
    match err {
        LLMError::Aborted { .. } | LLMError::ResponseProcessing { .. } => err,
        other => LLMError::ResponseProcessing {
            status: response.status,
            body: response.body_lossy(),
            message: other.to_string(),
        },
    }
}

/// Canonical reason phrase for an HTTP status, e.g. `503` → `Service Unavailable`.
pub fn status_text(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

/// Failure handler that parses the error body against a known error shape.
///
/// When the body is empty or does not deserialize, the message falls back to the
/// HTTP status text. Retryability comes from the handler predicate, which defaults
/// to the 429/5xx rule and is evaluated against the parsed error when available.
pub struct JsonFailureHandler<E: DeserializeOwned> {
    message_of: fn(&E) -> String,
    retry_predicate: fn(u16, Option<&E>) -> bool,
}

impl<E: DeserializeOwned> JsonFailureHandler<E> {
    /// Creates a handler extracting the human-readable message via `message_of`.
    pub fn new(message_of: fn(&E) -> String) -> Self {
        Self {
            message_of,
            retry_predicate: |status, _| default_http_retryable(status),
        }
    }

    /// Overrides the default 429/5xx retryability rule.
    pub fn with_retry_predicate(mut self, predicate: fn(u16, Option<&E>) -> bool) -> Self {
        self.retry_predicate = predicate;
        self
    }

    /// Builds the typed [`LLMError::Http`] for a failure response.
    ///
    /// This handler never fails: unparseable bodies degrade to the status text
    /// instead of producing a secondary error.
    pub fn handle(&self, response: &HttpResponse) -> Result<LLMError, LLMError> {
        let status = response.status;
        let parsed: Option<E> = std::str::from_utf8(&response.body)
            .ok()
            .filter(|text| !text.trim().is_empty())
            .and_then(|text| serde_json::from_str(text).ok());

        let message = match &parsed {
            Some(error) => (self.message_of)(error),
            None => status_text(status),
        };
        let retryable = (self.retry_predicate)(status, parsed.as_ref());

        Ok(LLMError::Http {
            status,
            message,
            body: response.body_lossy(),
            retryable,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU16, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;
    use serde::Deserialize;

    use super::*;
    use crate::http::{HttpStreamResponse, HttpTransport};

    /// Transport that replays a canned response.
    struct CannedTransport {
        status: u16,
        body: Vec<u8>,
        sends: AtomicU16,
    }

    impl CannedTransport {
        fn new(status: u16, body: &[u8]) -> Self {
            Self {
                status,
                body: body.to_vec(),
                sends: AtomicU16::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
            })
        }

        async fn send_stream(
            &self,
            _request: HttpRequest,
        ) -> Result<HttpStreamResponse, LLMError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<Result<Vec<u8>, LLMError>> = vec![Ok(self.body.clone())];
            Ok(HttpStreamResponse {
                status: self.status,
                headers: HashMap::new(),
                body: Box::pin(stream::iter(chunks)),
            })
        }
    }

    #[derive(Deserialize)]
    struct TestErrorBody {
        message: String,
    }

    fn test_failure_handler() -> JsonFailureHandler<TestErrorBody> {
        JsonFailureHandler::new(|error: &TestErrorBody| error.message.clone())
    }

    #[tokio::test]
    async fn success_handler_sees_two_xx_body() {
        let transport = CannedTransport::new(200, br#"{"value":42}"#);
        let handler = test_failure_handler();
        let result: i64 = post(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |response| {
                let value: serde_json::Value = serde_json::from_slice(&response.body)
                    .map_err(|err| LLMError::validation(err.to_string()))?;
                Ok(value["value"].as_i64().unwrap_or_default())
            },
            |response| handler.handle(response),
            &CancellationToken::new(),
        )
        .await
        .expect("call should succeed");
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn empty_503_body_falls_back_to_status_text_and_is_retryable() {
        let transport = CannedTransport::new(503, b"");
        let handler = test_failure_handler();
        let err = post(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |_response| Ok(()),
            |response| handler.handle(response),
            &CancellationToken::new(),
        )
        .await
        .expect_err("503 must fail");

        match err {
            LLMError::Http {
                status,
                message,
                retryable,
                ..
            } => {
                assert_eq!(status, 503);
                assert_eq!(message, "Service Unavailable");
                assert!(retryable);
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[tokio::test]
    async fn parsed_error_body_feeds_message_and_predicate() {
        let transport = CannedTransport::new(400, br#"{"message":"model is required"}"#);
        let handler = test_failure_handler();
        let err = post(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |_response| Ok(()),
            |response| handler.handle(response),
            &CancellationToken::new(),
        )
        .await
        .expect_err("400 must fail");

        match err {
            LLMError::Http {
                status,
                message,
                retryable,
                body,
            } => {
                assert_eq!(status, 400);
                assert_eq!(message, "model is required");
                assert!(!retryable);
                assert!(body.contains("model is required"));
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crashing_success_handler_wraps_as_response_processing() {
        let transport = CannedTransport::new(200, b"not json at all");
        let handler = test_failure_handler();
        let err: LLMError = post(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |response| {
                serde_json::from_slice::<serde_json::Value>(&response.body)
                    .map_err(|err| LLMError::validation(err.to_string()))
            },
            |response| handler.handle(response),
            &CancellationToken::new(),
        )
        .await
        .expect_err("handler must fail");

        match &err {
            LLMError::ResponseProcessing { status, body, .. } => {
                assert_eq!(*status, 200);
                assert_eq!(body, "not json at all");
            }
            other => panic!("unexpected error type: {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_before_sending() {
        let transport = CannedTransport::new(200, b"{}");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = test_failure_handler();
        let err = post(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |_response| Ok(()),
            |response| handler.handle(response),
            &cancel,
        )
        .await
        .expect_err("must abort");
        assert!(err.is_abort());
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_streaming_request_collects_error_body() {
        let transport = CannedTransport::new(429, br#"{"message":"slow down"}"#);
        let handler = test_failure_handler();
        let err = post_stream(
            &transport,
            "https://example.com/v1",
            HashMap::new(),
            Vec::new(),
            |response| handler.handle(response),
            &CancellationToken::new(),
        )
        .await
        .err()
        .expect("429 must fail");

        match err {
            LLMError::Http {
                status,
                message,
                retryable,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
                assert!(retryable);
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }
}
