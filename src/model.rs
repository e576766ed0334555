//! Capability traits vendor adapters implement.
//!
//! One trait per operation family, object-safe and dynamically dispatched, so an
//! application can hold `Arc<dyn TextGenerationModel>` without caring which
//! vendor sits behind it. Adapters build their requests from these inputs and
//! drive them through the call executor and wire parser.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::channel::StreamReceiver;
use crate::error::LLMError;
use crate::schema::OutputSchema;
use crate::structured::{StructureEvent, run_structure_extractor};

/// Input to a text-generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextPrompt {
    /// Optional system / instruction text.
    pub system: Option<String>,
    /// The user message.
    pub user: String,
}

impl TextPrompt {
    pub fn new<T: Into<String>>(user: T) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system<T: Into<String>>(mut self, system: T) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A complete (non-streamed) generation result.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    /// Vendor-reported model identifier, when the response carries one.
    pub model: Option<String>,
}

/// One incremental piece of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

/// Ordered stream of text deltas ending when the adapter closes the channel.
pub type TextStream = StreamReceiver<TextDelta>;

/// Text-generation capability.
#[async_trait]
pub trait TextGenerationModel: Send + Sync {
    /// Identifier used in logs, e.g. `"openai/gpt-4o-mini"`.
    fn name(&self) -> &str;

    /// Single-response generation.
    async fn generate_text(
        &self,
        prompt: TextPrompt,
        cancel: CancellationToken,
    ) -> Result<GeneratedText, LLMError>;

    /// Streaming generation; the stream closes with [`LLMError::Aborted`] when
    /// the token fires mid-stream.
    async fn stream_text(
        &self,
        prompt: TextPrompt,
        cancel: CancellationToken,
    ) -> Result<TextStream, LLMError>;
}

/// Embedding capability.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    /// Embeds each input; the result vector is index-aligned with the inputs.
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<Vec<Vec<f32>>, LLMError>;
}

pub type DynTextGenerationModel = Arc<dyn TextGenerationModel>;
pub type DynEmbeddingModel = Arc<dyn EmbeddingModel>;

/// Bridges a text-delta stream into structured-output events.
///
/// Feeds every delta into the incremental extractor and validates the complete
/// text against `schema` once the delta stream ends.
pub fn stream_structure<S>(
    deltas: TextStream,
    schema: S,
    cancel: CancellationToken,
) -> StreamReceiver<StructureEvent>
where
    S: OutputSchema + 'static,
{
    run_structure_extractor(
        deltas.map(|item| item.map(|delta| delta.text)),
        schema,
        cancel,
    )
}
