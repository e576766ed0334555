//! Resilient call-execution and streaming pipeline for multi-provider LLM clients.

pub mod channel;
pub mod error;
pub mod executor;
pub mod http;
pub mod model;
pub mod repair;
pub mod retry;
pub mod schema;
pub mod structured;
pub mod throttle;
pub mod wire;

pub use channel::{StreamReceiver, StreamSender, stream_channel};
pub use error::{GiveUpReason, LLMError};
pub use executor::call_with_retry_and_throttle;
pub use model::{
    DynEmbeddingModel, DynTextGenerationModel, EmbeddingModel, GeneratedText, TextDelta,
    TextGenerationModel, TextPrompt, TextStream, stream_structure,
};
pub use retry::RetryPolicy;
pub use schema::{FrameSchema, JsonFrameSchema, JsonSchema, OutputSchema};
pub use structured::{StructureAccumulator, StructureEvent, parse_structure};
pub use throttle::ThrottlePolicy;
pub use wire::{WireEvent, WireFormat, run_wire_parser};
