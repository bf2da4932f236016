//! # Result streams: the one-request channel between an engine and a waiter.
//!
//! ```text
//!  Engine side                               Waiter side (scheduler)
//!  ResultSender ── write(partial)  ──┐
//!               ── complete(final) ──┼──► mpsc ──► ResultStream::next()
//!               ── fail(reason)    ──┘                 │
//!  CancellationToken ◄──────────── shared ─────────────┘
//! ```
//!
//! ## Rules
//! - At most one terminal item (`complete` or `fail`) is ever sent.
//! - Once the token is cancelled nothing else is delivered: the waiter sees
//!   [`StreamEvent::Cancelled`], even if a result was already buffered.
//! - Finishing (or dropping) the sender releases its pool entry.
//! - A sender dropped without finishing looks like a failure to the waiter.

use std::sync::Weak;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{AnalysisKey, AnalysisResponse};

use super::shared::Shared;

enum Item {
    Partial(AnalysisResponse),
    Complete(AnalysisResponse),
    Failed(String),
}

/// What a waiter observes.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Intermediate result; more will follow.
    Partial(AnalysisResponse),
    /// Final result.
    Complete(AnalysisResponse),
    /// The request failed without a result message.
    Failed(String),
    /// The request was superseded or cancelled.
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Partial(_))
    }
}

pub(super) fn channel(
    key: AnalysisKey,
    ticket: u64,
    pool: Weak<Shared>,
) -> (ResultSender, ResultStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let sender = ResultSender {
        key: key.clone(),
        ticket,
        tx,
        cancel: cancel.clone(),
        pool,
        finished: false,
    };
    let stream = ResultStream {
        key,
        rx,
        cancel,
        done: false,
    };
    (sender, stream)
}

/// Producer half, owned by the engine serving the request.
pub struct ResultSender {
    key: AnalysisKey,
    ticket: u64,
    tx: mpsc::UnboundedSender<Item>,
    cancel: CancellationToken,
    pool: Weak<Shared>,
    finished: bool,
}

impl ResultSender {
    pub fn key(&self) -> &AnalysisKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the request is superseded or cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Delivers an intermediate result. Ignored once finished or cancelled.
    pub fn write(&mut self, partial: AnalysisResponse) -> bool {
        if self.finished || self.is_cancelled() {
            return false;
        }
        self.tx.send(Item::Partial(partial)).is_ok()
    }

    /// Delivers the final result. Returns whether it reached the waiter's queue.
    pub fn complete(&mut self, response: AnalysisResponse) -> bool {
        self.finish(Item::Complete(response))
    }

    /// Terminates the request without a result message.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.finish(Item::Failed(reason.into()))
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(super) fn ticket(&self) -> u64 {
        self.ticket
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn finish(&mut self, item: Item) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        let delivered = !self.is_cancelled() && self.tx.send(item).is_ok();
        self.release();
        delivered
    }

    fn release(&self) {
        if let Some(shared) = self.pool.upgrade() {
            shared.release(&self.key, self.ticket);
        }
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.release();
        }
    }
}

/// Consumer half, returned by [`Pool::submit`](crate::Pool::submit).
pub struct ResultStream {
    key: AnalysisKey,
    rx: mpsc::UnboundedReceiver<Item>,
    cancel: CancellationToken,
    done: bool,
}

impl ResultStream {
    pub fn key(&self) -> &AnalysisKey {
        &self.key
    }

    /// Cancels the request from the waiting side.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event; `None` after a terminal event was returned.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StreamEvent::Cancelled,
            item = self.rx.recv() => match item {
                Some(Item::Partial(r)) => return Some(StreamEvent::Partial(r)),
                Some(Item::Complete(r)) => StreamEvent::Complete(r),
                Some(Item::Failed(reason)) => StreamEvent::Failed(reason),
                None if self.cancel.is_cancelled() => StreamEvent::Cancelled,
                None => StreamEvent::Failed("result stream closed".to_owned()),
            },
        };
        self.done = true;
        Some(event)
    }
}
