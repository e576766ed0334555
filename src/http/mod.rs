//! Minimal HTTP seam decoupling the pipeline from the concrete client.
//!
//! The pipeline only ever issues JSON POST requests; sockets, TLS, and connection
//! pooling live behind [`HttpTransport`]. The default implementation in
//! [`reqwest`](self::reqwest) is the only module that touches a real HTTP library.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::LLMError;

/// One outgoing POST request with a fully-assembled URL and header map.
///
/// Vendor adapters resolve credentials and base URLs themselves; by the time a
/// request reaches the transport it carries everything needed on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a POST request carrying a JSON body.
    ///
    /// # Examples
    ///
    /// ```
    /// use nagare_llm::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(
    ///     request.headers.get("Content-Type"),
    ///     Some(&"application/json".to_string())
    /// );
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body,
            timeout: None,
        }
    }

    /// Replaces the header map after construction.
    ///
    /// Adapters supply the complete header set (authorization included), so the
    /// replacement semantics are intentional.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Fully-buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, LLMError> {
        String::from_utf8(self.body).map_err(|err| LLMError::transport(err.to_string()))
    }

    /// Lossy view of the body for diagnostics; never fails.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP response whose body arrives as a byte stream.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

/// Transport abstraction used to decouple the pipeline from the concrete HTTP client.
///
/// Implementations map network failures to [`LLMError::Transport`]; every other
/// classification (status handling, body decoding) happens one layer up in
/// [`call`](super::http::call).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves once the full response body is buffered.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns the response with a streaming body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

pub mod call;
pub mod reqwest;
