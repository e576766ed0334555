//! Incremental reconstruction of structured JSON output from text deltas.
//!
//! Providers stream structured output as plain text fragments; at almost any
//! moment the accumulated text is invalid JSON. The accumulator keeps the full
//! text, best-effort parses it after each delta, and emits a partial value only
//! when it actually changed. Schema validation runs exactly once, on the final
//! complete text.

use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::{StreamReceiver, stream_channel};
use crate::error::LLMError;
use crate::repair::parse_partial_json;
use crate::schema::OutputSchema;

/// One observation of the structured value under construction.
#[derive(Debug, Clone, PartialEq)]
pub enum StructureEvent {
    /// Best-effort snapshot parsed from incomplete text. May be semantically
    /// wrong in its trailing fields; never schema-validated.
    Partial(Value),
    /// The parsed and schema-validated final value. Always the last event.
    Final(Value),
}

/// Accumulates text deltas and tracks the last partial value emitted.
#[derive(Debug, Default)]
pub struct StructureAccumulator {
    text: String,
    last_emitted: Option<Value>,
}

impl StructureAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full text received so far.
    pub fn raw_text(&self) -> &str {
        &self.text
    }

    /// Appends one delta and returns a new partial value, if any.
    ///
    /// Returns `None` both when the text still parses to nothing and when the
    /// parsed value equals the previously emitted one, so consecutive deltas that
    /// only extend an incomplete trailing member produce a single event.
    pub fn push_delta(&mut self, delta: &str) -> Option<Value> {
        self.text.push_str(delta);
        let value = parse_partial_json(&self.text)?;
        if self.last_emitted.as_ref() == Some(&value) {
            return None;
        }
        self.last_emitted = Some(value.clone());
        Some(value)
    }

    /// Parses and validates the complete accumulated text.
    ///
    /// The final text still goes through repair before giving up: some providers
    /// terminate the stream a byte or two short of well-formed JSON.
    ///
    /// # Errors
    ///
    /// [`LLMError::StructureParse`] when the text is not JSON even after repair;
    /// [`LLMError::StructureValidation`] when the parsed value fails the schema.
    pub fn finish(&self, schema: &dyn OutputSchema) -> Result<Value, LLMError> {
        let value = match serde_json::from_str(&self.text) {
            Ok(value) => value,
            Err(strict_err) => {
                tracing::debug!(error = %strict_err, "final text failed strict parse, repairing");
                parse_partial_json(&self.text).ok_or_else(|| LLMError::StructureParse {
                    raw_text: self.text.clone(),
                    message: strict_err.to_string(),
                })?
            }
        };
        schema
            .validate(&value)
            .map_err(|message| LLMError::StructureValidation {
                raw_text: self.text.clone(),
                value: value.clone(),
                message,
            })?;
        Ok(value)
    }
}

/// Strict parse + validation of complete (non-streamed) structured output.
///
/// No repair is attempted: a complete response body is expected to be
/// well-formed as-is.
///
/// # Errors
///
/// Same taxonomy as [`StructureAccumulator::finish`].
pub fn parse_structure(text: &str, schema: &dyn OutputSchema) -> Result<Value, LLMError> {
    let value: Value = serde_json::from_str(text).map_err(|err| LLMError::StructureParse {
        raw_text: text.to_string(),
        message: err.to_string(),
    })?;
    schema
        .validate(&value)
        .map_err(|message| LLMError::StructureValidation {
            raw_text: text.to_string(),
            value: value.clone(),
            message,
        })?;
    Ok(value)
}

/// Drives a [`StructureAccumulator`] over a stream of text deltas.
///
/// A background task feeds the returned receiver: deduplicated
/// [`StructureEvent::Partial`] snapshots while deltas arrive, then exactly one
/// [`StructureEvent::Final`] (or a terminal error) when the delta stream ends.
/// A delta-stream error or cancellation closes the channel with that error and
/// no final value is produced.
pub fn run_structure_extractor<D, S>(
    deltas: D,
    schema: S,
    cancel: CancellationToken,
) -> StreamReceiver<StructureEvent>
where
    D: Stream<Item = Result<String, LLMError>> + Send + 'static,
    S: OutputSchema + 'static,
{
    let (mut tx, rx) = stream_channel();
    tokio::spawn(async move {
        let mut deltas = std::pin::pin!(deltas);
        let mut accumulator = StructureAccumulator::new();
        loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tx.close_with_error(LLMError::aborted("structure extraction cancelled"));
                    return;
                }
                delta = deltas.next() => delta,
            };
            match delta {
                Some(Ok(text)) => {
                    if let Some(value) = accumulator.push_delta(&text) {
                        if !tx.send(StructureEvent::Partial(value)) {
                            // Consumer went away, stop accumulating.
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    tx.close_with_error(err);
                    return;
                }
                None => break,
            }
        }
        match accumulator.finish(&schema) {
            Ok(value) => {
                tx.send(StructureEvent::Final(value));
                tx.close();
            }
            Err(err) => tx.close_with_error(err),
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};
    use serde_json::json;

    use super::*;
    use crate::schema::JsonSchema;

    fn object_schema() -> JsonSchema {
        JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" },
                "c": { "type": "integer" }
            },
            "required": ["a", "b", "c"]
        }))
        .expect("valid schema")
    }

    #[test]
    fn equal_consecutive_partials_emit_once() {
        let mut acc = StructureAccumulator::new();
        // The dangling `"b":` member repairs away, so both snapshots equal {"a":1}.
        assert_eq!(acc.push_delta(r#"{"a":1,"#), Some(json!({ "a": 1 })));
        assert_eq!(acc.push_delta(r#""b":"#), None);
        assert_eq!(acc.push_delta("2"), Some(json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn dangling_key_repairs_to_the_committed_prefix() {
        let mut acc = StructureAccumulator::new();
        assert_eq!(acc.push_delta(""), None);
        // The unterminated key truncates away, leaving the empty object.
        assert_eq!(acc.push_delta(r#"{"key"#), Some(json!({})));
        assert_eq!(acc.push_delta(r#"":1}"#), Some(json!({ "key": 1 })));
        assert_eq!(acc.raw_text(), r#"{"key":1}"#);
    }

    #[test]
    fn finish_validates_the_complete_text() {
        let schema = object_schema();
        let mut acc = StructureAccumulator::new();
        acc.push_delta(r#"{"a":1,"b":2,"c":3}"#);
        assert_eq!(
            acc.finish(&schema).expect("valid"),
            json!({ "a": 1, "b": 2, "c": 3 })
        );
    }

    #[test]
    fn finish_reports_schema_violations_with_context() {
        let schema = object_schema();
        let mut acc = StructureAccumulator::new();
        acc.push_delta(r#"{"a":1,"b":2}"#);
        let err = acc.finish(&schema).expect_err("missing `c`");
        match err {
            LLMError::StructureValidation {
                raw_text,
                value,
                message,
            } => {
                assert_eq!(raw_text, r#"{"a":1,"b":2}"#);
                assert_eq!(value, json!({ "a": 1, "b": 2 }));
                assert!(message.contains("c"), "got: {message}");
            }
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn finish_repairs_a_slightly_truncated_tail() {
        let schema = JsonSchema::new(json!({ "type": "object" })).expect("valid schema");
        let mut acc = StructureAccumulator::new();
        acc.push_delta(r#"{"a":1"#);
        assert_eq!(acc.finish(&schema).expect("repaired"), json!({ "a": 1 }));
    }

    #[test]
    fn finish_surfaces_unparseable_text() {
        let schema = JsonSchema::new(json!({ "type": "object" })).expect("valid schema");
        let mut acc = StructureAccumulator::new();
        acc.push_delta("not json at all");
        let err = acc.finish(&schema).expect_err("unparseable");
        assert!(matches!(err, LLMError::StructureParse { .. }));
    }

    #[test]
    fn parse_structure_is_strict() {
        let schema = JsonSchema::new(json!({ "type": "object" })).expect("valid schema");
        assert_eq!(
            parse_structure(r#"{"ok":true}"#, &schema).expect("valid"),
            json!({ "ok": true })
        );
        // Truncated input is a parse error here, never repaired.
        let err = parse_structure(r#"{"ok":"#, &schema).expect_err("truncated");
        assert!(matches!(err, LLMError::StructureParse { .. }));
    }

    #[tokio::test]
    async fn extractor_emits_deduplicated_partials_then_final() {
        let deltas = stream::iter(
            [r#"{"a":1,"#, r#""b":"#, r#"2,"c":"#, "3}"]
                .map(|s| Ok::<_, LLMError>(s.to_string())),
        );
        let events: Vec<_> = run_structure_extractor(deltas, object_schema(), CancellationToken::new())
            .collect()
            .await;

        let events: Vec<StructureEvent> = events
            .into_iter()
            .map(|item| item.expect("no error"))
            .collect();
        assert_eq!(
            events,
            vec![
                StructureEvent::Partial(json!({ "a": 1 })),
                StructureEvent::Partial(json!({ "a": 1, "b": 2 })),
                // The closing delta completes the document: one last partial,
                // then the validated final value.
                StructureEvent::Partial(json!({ "a": 1, "b": 2, "c": 3 })),
                StructureEvent::Final(json!({ "a": 1, "b": 2, "c": 3 })),
            ]
        );
    }

    #[tokio::test]
    async fn extractor_ends_with_validation_error_when_a_field_is_missing() {
        let deltas = stream::iter(
            [r#"{"a":1,"#, r#""b":2}"#].map(|s| Ok::<_, LLMError>(s.to_string())),
        );
        let mut rx =
            run_structure_extractor(deltas, object_schema(), CancellationToken::new());

        let first = rx.next().await.expect("partial").expect("ok");
        assert_eq!(first, StructureEvent::Partial(json!({ "a": 1 })));
        let second = rx.next().await.expect("partial").expect("ok");
        assert_eq!(second, StructureEvent::Partial(json!({ "a": 1, "b": 2 })));
        let err = rx.next().await.expect("terminal error").expect_err("fails");
        assert!(matches!(err, LLMError::StructureValidation { .. }));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn extractor_propagates_delta_stream_errors() {
        let deltas = stream::iter(vec![
            Ok(r#"{"a":1}"#.to_string()),
            Err(LLMError::StreamDecode {
                message: "bad frame".to_string(),
            }),
        ]);
        let schema = JsonSchema::new(json!({ "type": "object" })).expect("valid schema");
        let mut rx = run_structure_extractor(deltas, schema, CancellationToken::new());

        assert!(rx.next().await.expect("partial").is_ok());
        let err = rx.next().await.expect("error").expect_err("is error");
        assert!(matches!(err, LLMError::StreamDecode { .. }));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream_with_aborted() {
        let cancel = CancellationToken::new();
        // A delta stream that never ends.
        let deltas = stream::pending();
        let schema = JsonSchema::new(json!({ "type": "object" })).expect("valid schema");
        let mut rx = run_structure_extractor(deltas, schema, cancel.clone());

        cancel.cancel();
        let err = rx.next().await.expect("terminal error").expect_err("aborted");
        assert!(err.is_abort());
        assert!(rx.next().await.is_none());
    }
}
