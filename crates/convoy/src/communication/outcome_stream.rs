use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::Epoch;

/// What a single `infer` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferStatus {
    /// A batch was evaluated and committed.
    Evaluated,
    /// Nothing was queued; the epoch advanced without an evaluation.
    Empty,
    /// The evaluator had no free cache slot; the batch is still queued.
    NoCacheSlot,
    /// Cancelled before the evaluator finished; the batch is still queued.
    Cancelled,
    /// The evaluator failed with this code and the scheduler is faulted.
    Failed(i32),
}

/// Reported to subscribers after every `infer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferOutcome {
    /// Scheduler epoch after the call.
    pub epoch: Epoch,
    /// Rows in the batch that was submitted, `0` for an empty call.
    pub tokens: usize,
    pub status: InferStatus,
}

/// # OutcomeStream
///
/// An asynchronous stream of [`InferOutcome`]s, one per `infer` call made after
/// subscribing.
///
/// ## Implementation Details
///
/// The stream is backed by a Tokio unbounded channel receiver, which means:
/// - It never applies backpressure to the scheduler
/// - It returns `None` once the scheduler has been dropped
pub struct OutcomeStream {
    receiver: mpsc::UnboundedReceiver<InferOutcome>,
}

impl Stream for OutcomeStream {
    type Item = InferOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

/// Fan-out of outcomes to every live [`OutcomeStream`].
#[derive(Debug, Default)]
pub(crate) struct OutcomeSubscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<InferOutcome>>>,
}

impl OutcomeSubscribers {
    pub fn subscribe(&self) -> OutcomeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        OutcomeStream { receiver: rx }
    }

    /// Send to every subscriber, forgetting the ones whose stream was dropped.
    pub fn publish(&self, outcome: InferOutcome) {
        self.senders.lock().retain(|sender| sender.send(outcome).is_ok());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }
}
