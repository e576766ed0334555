use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Why a retry loop stopped re-attempting a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// Every allowed attempt was consumed.
    MaxTriesExceeded,
    /// The last failure was not retryable, so further attempts would be pointless.
    ErrorNotRetryable,
    /// The caller cancelled the call.
    Aborted,
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MaxTriesExceeded => "max-tries-exceeded",
            Self::ErrorNotRetryable => "error-not-retryable",
            Self::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Aggregates every failure mode exposed by the call-execution and streaming pipeline.
///
/// Each variant carries enough context (status, body, raw text, offending value) to
/// reconstruct the failure for logging without re-running the remote call. Callers can
/// match on the specific variant to decide whether to retry, fall back, or surface an
/// actionable message.
#[derive(Debug, Clone, Error)]
pub enum LLMError {
    /// Network-level failure raised before any HTTP response was received.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Transport failures default to retryable; set to `false` for failures that
        /// re-sending cannot fix (e.g. an invalid header).
        retryable: bool,
    },
    /// Non-2xx HTTP response, classified by status and the failure handler.
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        /// Message extracted from the error body, or the HTTP status text when the
        /// body was empty or unparseable.
        message: String,
        /// Raw response body kept verbatim for diagnostics.
        body: String,
        retryable: bool,
    },
    /// A handler failed while decoding a response body.
    ///
    /// This covers both a success handler choking on a 2xx body and a failure handler
    /// choking on a malformed error body. Never retryable: re-sending would reproduce
    /// the same payload.
    #[error("response processing failed with status {status}: {message}")]
    ResponseProcessing {
        status: u16,
        /// Raw response body kept verbatim for diagnostics.
        body: String,
        message: String,
    },
    /// A retry policy gave up. Carries the complete attempt history in order.
    #[error("retry gave up ({reason}) after {} attempt(s); last: {}", .errors.len(), last_message(.errors))]
    RetriesExhausted {
        reason: GiveUpReason,
        /// One entry per physical attempt, oldest first.
        errors: Vec<LLMError>,
    },
    /// Accumulated text could not be parsed as JSON, even after best-effort repair.
    #[error("structured output is not valid JSON: {message}")]
    StructureParse { raw_text: String, message: String },
    /// Accumulated text parsed but the value failed schema validation.
    #[error("structured output failed schema validation: {message}")]
    StructureValidation {
        raw_text: String,
        /// The parsed-but-invalid value, kept for diagnostics.
        value: Value,
        message: String,
    },
    /// A wire frame failed decoding or schema validation mid-stream.
    #[error("stream decode error: {message}")]
    StreamDecode { message: String },
    /// A streaming channel closed before delivering its terminal marker.
    #[error("stream closed unexpectedly: {message}")]
    StreamClosed { message: String },
    /// Cancellation triggered explicitly by the caller.
    #[error("request aborted: {message}")]
    Aborted { message: String },
    /// Request-side validation failure, e.g. a body that cannot be serialized.
    #[error("invalid request: {message}")]
    Validation { message: String },
}

fn last_message(errors: &[LLMError]) -> String {
    errors
        .last()
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no recorded attempts".to_string())
}

impl LLMError {
    /// Creates a retryable [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use nagare_llm::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// assert!(err.is_retryable());
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an [`LLMError::Aborted`] describing who or what cancelled the request.
    pub fn aborted<T: Into<String>>(message: T) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Validation`] for request-side failures.
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns `true` when re-attempting the call might succeed.
    ///
    /// Only transport failures and HTTP failures flagged retryable (429/5xx by
    /// default) qualify. Structure and stream errors occur after a successful HTTP
    /// exchange, so retrying them would reproduce the same malformed output.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } | Self::Http { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns `true` when the failure was caused by caller cancellation.
    ///
    /// Retry policies use this to propagate cancellation distinctly instead of
    /// re-attempting, per the cancellation contract.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Aborted { .. }
                | Self::RetriesExhausted {
                    reason: GiveUpReason::Aborted,
                    ..
                }
        )
    }
}

/// Default HTTP retryability rule: 429 and every 5xx status are worth re-sending.
pub fn default_http_retryable(status: u16) -> bool {
    status == 429 || status >= 500
}
