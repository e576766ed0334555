//! Ordered, closable producer/consumer queue decoupling wire parsing from
//! caller-side iteration.
//!
//! A channel belongs to exactly one streaming call: the background producer pushes
//! decoded items, the foreground consumer iterates them as a [`Stream`], and the
//! buffers are discarded when the channel closes. Items are observed strictly in
//! push order; closing (normally or with an error) is idempotent and rejects any
//! further items.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::error::LLMError;

/// Creates a connected sender/receiver pair.
pub fn stream_channel<T>() -> (StreamSender<T>, StreamReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx: Some(tx) }, StreamReceiver { rx })
}

/// Producer half of a stream channel.
pub struct StreamSender<T> {
    tx: Option<mpsc::UnboundedSender<Result<T, LLMError>>>,
}

impl<T> StreamSender<T> {
    /// Pushes one item.
    ///
    /// Returns `false` when the channel is closed: either this side already
    /// closed it, or the consumer dropped the receiver. Producers treat a `false`
    /// return as a stop signal.
    pub fn send(&mut self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(item)).is_ok(),
            None => false,
        }
    }

    /// Closes the channel normally. Idempotent.
    ///
    /// Items already pushed stay observable; the consumer sees the end of the
    /// stream after draining them, even if it is still mid-iteration when the
    /// producer closes.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Closes the channel with a terminal error. Idempotent.
    ///
    /// The error is delivered as the final stream item, after everything pushed
    /// before it.
    pub fn close_with_error(&mut self, err: LLMError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Returns `true` once the channel no longer accepts items.
    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// Consumer half of a stream channel; an asynchronous sequence of pushed items.
pub struct StreamReceiver<T> {
    rx: mpsc::UnboundedReceiver<Result<T, LLMError>>,
}

impl<T> Stream for StreamReceiver<T> {
    type Item = Result<T, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
