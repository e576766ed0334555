//! Structured-output and wire-frame schema contracts.
//!
//! The pipeline never assumes a specific schema library: validation happens behind
//! [`OutputSchema`] and [`FrameSchema`]. The built-in implementations are backed by
//! the `jsonschema` crate.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::LLMError;

/// Caller-supplied schema for structured (JSON) output.
pub trait OutputSchema: Send + Sync {
    /// Validates a parsed value; the failure message is embedded into
    /// [`LLMError::StructureValidation`].
    fn validate(&self, value: &Value) -> Result<(), String>;

    /// JSON Schema representation, e.g. for inclusion in a provider request body.
    fn json_schema(&self) -> Value;
}

/// [`OutputSchema`] backed by a compiled JSON Schema.
#[derive(Debug)]
pub struct JsonSchema {
    schema: Value,
    validator: jsonschema::Validator,
}

impl JsonSchema {
    /// Compiles a JSON Schema document.
    ///
    /// # Errors
    ///
    /// [`LLMError::Validation`] when the document itself is not a valid schema.
    pub fn new(schema: Value) -> Result<Self, LLMError> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| LLMError::validation(format!("invalid JSON schema: {err}")))?;
        Ok(Self { schema, validator })
    }
}

impl OutputSchema for JsonSchema {
    fn validate(&self, value: &Value) -> Result<(), String> {
        self.validator
            .validate(value)
            .map_err(|err| err.to_string())
    }

    fn json_schema(&self) -> Value {
        self.schema.clone()
    }
}

/// Caller-supplied discriminated-union schema for one wire frame.
///
/// The wire parser decodes every frame through this trait before pushing it into
/// the stream channel; a frame reported final triggers channel close immediately
/// after being pushed.
pub trait FrameSchema: Send + Sync {
    type Frame;

    /// Decodes and validates one frame payload.
    fn decode(&self, payload: &str) -> Result<Self::Frame, String>;

    /// Whether this frame is tagged terminal by the protocol
    /// (e.g. `"done": true` or `"stop": true`).
    fn is_final(&self, frame: &Self::Frame) -> bool;
}

/// [`FrameSchema`] decoding JSON payloads into `T`, with optional JSON Schema
/// validation applied before deserialization.
pub struct JsonFrameSchema<T> {
    validator: Option<jsonschema::Validator>,
    final_predicate: fn(&T) -> bool,
    _frame: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonFrameSchema<T> {
    /// Creates a schema with the protocol's final-frame predicate.
    pub fn new(final_predicate: fn(&T) -> bool) -> Self {
        Self {
            validator: None,
            final_predicate,
            _frame: PhantomData,
        }
    }

    /// Additionally validates each frame against a JSON Schema before decoding.
    ///
    /// # Errors
    ///
    /// [`LLMError::Validation`] when the document is not a valid schema.
    pub fn with_json_schema(mut self, schema: &Value) -> Result<Self, LLMError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|err| LLMError::validation(format!("invalid frame schema: {err}")))?;
        self.validator = Some(validator);
        Ok(self)
    }
}

impl<T: DeserializeOwned + Send> FrameSchema for JsonFrameSchema<T> {
    type Frame = T;

    fn decode(&self, payload: &str) -> Result<T, String> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| format!("frame is not valid JSON: {err}"))?;
        if let Some(validator) = &self.validator {
            validator
                .validate(&value)
                .map_err(|err| format!("frame failed schema validation: {err}"))?;
        }
        serde_json::from_value(value)
            .map_err(|err| format!("frame does not match the expected shape: {err}"))
    }

    fn is_final(&self, frame: &T) -> bool {
        (self.final_predicate)(frame)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[test]
    fn json_schema_accepts_conforming_values() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": { "a": { "type": "integer" } },
            "required": ["a"]
        }))
        .expect("valid schema");

        assert!(schema.validate(&json!({ "a": 1 })).is_ok());
        let message = schema
            .validate(&json!({ "b": 1 }))
            .expect_err("missing required field");
        assert!(message.contains("a"), "got: {message}");
    }

    #[test]
    fn json_schema_round_trips_its_document() {
        let document = json!({ "type": "string" });
        let schema = JsonSchema::new(document.clone()).expect("valid schema");
        assert_eq!(schema.json_schema(), document);
    }

    #[test]
    fn invalid_schema_document_is_rejected() {
        let err = JsonSchema::new(json!({ "type": "not-a-type" })).expect_err("bogus schema");
        assert!(matches!(err, LLMError::Validation { .. }));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestFrame {
        done: bool,
        v: i64,
    }

    #[test]
    fn frame_schema_decodes_and_tags_final_frames() {
        let schema = JsonFrameSchema::<TestFrame>::new(|frame| frame.done);

        let frame = schema.decode(r#"{"done":false,"v":1}"#).expect("decodes");
        assert_eq!(frame, TestFrame { done: false, v: 1 });
        assert!(!schema.is_final(&frame));

        let last = schema.decode(r#"{"done":true,"v":3}"#).expect("decodes");
        assert!(schema.is_final(&last));
    }

    #[test]
    fn frame_schema_reports_shape_mismatches() {
        let schema = JsonFrameSchema::<TestFrame>::new(|frame| frame.done);
        let message = schema.decode(r#"{"v":"text"}"#).expect_err("wrong shape");
        assert!(message.contains("expected shape"), "got: {message}");

        let message = schema.decode("not json").expect_err("not json");
        assert!(message.contains("not valid JSON"), "got: {message}");
    }

    #[test]
    fn frame_schema_with_json_schema_validates_before_decoding() {
        let schema = JsonFrameSchema::<TestFrame>::new(|frame| frame.done)
            .with_json_schema(&json!({
                "type": "object",
                "properties": { "v": { "type": "integer", "minimum": 0 } },
                "required": ["done", "v"]
            }))
            .expect("valid frame schema");

        assert!(schema.decode(r#"{"done":false,"v":2}"#).is_ok());
        let message = schema
            .decode(r#"{"done":false,"v":-4}"#)
            .expect_err("violates minimum");
        assert!(message.contains("schema validation"), "got: {message}");
    }
}
