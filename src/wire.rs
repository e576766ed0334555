//! Wire-level streaming protocols: SSE and NDJSON framing over an HTTP body.
//!
//! Both framings are line-based. Bytes arrive in arbitrary chunks, so a shared
//! line buffer carries partial lines across chunk boundaries; a line with invalid
//! UTF-8 surfaces as [`LLMError::StreamDecode`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::channel::{StreamReceiver, stream_channel};
use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::schema::FrameSchema;

/// Streaming body framing used by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Server-sent events: blank-line delimited frames of `data:`/`event:` lines.
    Sse,
    /// Newline-delimited JSON: one document per non-empty line.
    Ndjson,
}

/// One protocol-level event extracted from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// An SSE frame: joined `data:` payload plus the optional `event:` name.
    Data {
        event: Option<String>,
        data: String,
    },
    /// One NDJSON document.
    Object(String),
    /// The SSE `[DONE]` sentinel. Carries no payload.
    Done,
}

impl WireEvent {
    /// The frame payload to decode, or `None` for the end sentinel.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Data { data, .. } => Some(data),
            Self::Object(doc) => Some(doc),
            Self::Done => None,
        }
    }
}

/// Accumulates raw chunks and hands out complete lines.
///
/// Keeping incomplete bytes buffered means a UTF-8 sequence split across chunks
/// never trips decoding; only a genuinely invalid line does.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push_chunk(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Next complete line, without its `\n` (and `\r`, if any).
    fn next_line(&mut self) -> Option<Result<String, LLMError>> {
        let newline = self.bytes.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.bytes.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(decode_line(line))
    }

    /// Whatever is left after the body ended, as one final line.
    fn take_rest(&mut self) -> Option<Result<String, LLMError>> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.bytes)))
    }
}

fn decode_line(line: Vec<u8>) -> Result<String, LLMError> {
    String::from_utf8(line).map_err(|err| LLMError::StreamDecode {
        message: format!("stream line is not valid UTF-8: {err}"),
    })
}

/// SSE frame stream: blank-line delimited frames over an HTTP body.
///
/// Multiple `data:` lines in one frame are joined with `\n`; `event:` names are
/// carried on the resulting [`WireEvent::Data`]. The `[DONE]` sentinel becomes
/// [`WireEvent::Done`] and ends the stream; comment and unknown field lines are
/// ignored per the SSE format.
pub struct SseFrameStream {
    body: HttpBodyStream,
    lines: LineBuffer,
    event_name: Option<String>,
    data_lines: Vec<String>,
    pending: VecDeque<WireEvent>,
    closed: bool,
}

impl SseFrameStream {
    pub fn new(body: HttpBodyStream) -> Self {
        Self {
            body,
            lines: LineBuffer::default(),
            event_name: None,
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            closed: false,
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch_frame();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data_lines
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        } else if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
        }
        // Comments (`:`) and other fields (`id:`, `retry:`) are ignored.
    }

    fn dispatch_frame(&mut self) {
        if self.data_lines.is_empty() {
            self.event_name = None;
            return;
        }
        let data = self.data_lines.join("\n");
        let event = self.event_name.take();
        self.data_lines.clear();
        if data.trim() == "[DONE]" {
            self.pending.push_back(WireEvent::Done);
            self.closed = true;
        } else {
            self.pending.push_back(WireEvent::Data { event, data });
        }
    }
}

impl Stream for SseFrameStream {
    type Item = Result<WireEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.closed {
                return Poll::Ready(None);
            }
            // Drain complete lines before pulling more bytes.
            if let Some(line) = this.lines.next_line() {
                match line {
                    Ok(line) => this.handle_line(&line),
                    Err(err) => {
                        this.closed = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                continue;
            }
            match this.body.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.lines.push_chunk(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    this.closed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    // Flush a final frame that was not blank-line terminated.
                    if let Some(rest) = this.lines.take_rest() {
                        match rest {
                            Ok(line) => this.handle_line(&line),
                            Err(err) => {
                                this.closed = true;
                                return Poll::Ready(Some(Err(err)));
                            }
                        }
                    }
                    if !this.data_lines.is_empty() {
                        this.dispatch_frame();
                    }
                    this.closed = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// NDJSON frame stream: one [`WireEvent::Object`] per non-empty line.
pub struct NdjsonFrameStream {
    body: HttpBodyStream,
    lines: LineBuffer,
    closed: bool,
}

impl NdjsonFrameStream {
    pub fn new(body: HttpBodyStream) -> Self {
        Self {
            body,
            lines: LineBuffer::default(),
            closed: false,
        }
    }
}

impl Stream for NdjsonFrameStream {
    type Item = Result<WireEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.closed {
                return Poll::Ready(None);
            }
            if let Some(line) = this.lines.next_line() {
                match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => return Poll::Ready(Some(Ok(WireEvent::Object(line)))),
                    Err(err) => {
                        this.closed = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }
            match this.body.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.lines.push_chunk(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    this.closed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.closed = true;
                    match this.lines.take_rest() {
                        Some(Ok(line)) if line.trim().is_empty() => {}
                        Some(Ok(line)) => return Poll::Ready(Some(Ok(WireEvent::Object(line)))),
                        Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                        None => {}
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn wire_events(
    body: HttpBodyStream,
    format: WireFormat,
) -> Pin<Box<dyn Stream<Item = Result<WireEvent, LLMError>> + Send>> {
    match format {
        WireFormat::Sse => Box::pin(SseFrameStream::new(body)),
        WireFormat::Ndjson => Box::pin(NdjsonFrameStream::new(body)),
    }
}

/// Parses a streaming body into typed frames on a background task.
///
/// Every frame payload is decoded and validated through `schema` before it is
/// pushed. A frame the schema tags as final is pushed first, then the channel
/// closes; the `[DONE]` sentinel and plain end-of-body close the channel without
/// a trailing item. Decode or validation failure closes the channel with
/// [`LLMError::StreamDecode`]; cancellation closes it with [`LLMError::Aborted`].
pub fn run_wire_parser<S>(
    body: HttpBodyStream,
    format: WireFormat,
    schema: S,
    cancel: CancellationToken,
) -> StreamReceiver<S::Frame>
where
    S: FrameSchema + 'static,
    S::Frame: Send + 'static,
{
    let (mut tx, rx) = stream_channel();
    tokio::spawn(async move {
        let mut events = wire_events(body, format);
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tx.close_with_error(LLMError::aborted("streaming response cancelled"));
                    return;
                }
                event = events.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    let Some(payload) = event.payload() else {
                        // [DONE] sentinel.
                        tx.close();
                        return;
                    };
                    match schema.decode(payload) {
                        Ok(frame) => {
                            let is_final = schema.is_final(&frame);
                            if !tx.send(frame) {
                                return;
                            }
                            if is_final {
                                tx.close();
                                return;
                            }
                        }
                        Err(message) => {
                            tracing::warn!(%message, "dropping stream after undecodable frame");
                            tx.close_with_error(LLMError::StreamDecode { message });
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    tx.close_with_error(err);
                    return;
                }
                None => {
                    tx.close();
                    return;
                }
            }
        }
    });
    rx
}
