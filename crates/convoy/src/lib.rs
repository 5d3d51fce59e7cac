//! # Convoy
//!
//! A batched multi-conversation inference scheduler: many independent generation
//! threads share one autoregressive evaluation context and its key/value cache, and
//! their pending tokens travel together in single, large evaluation calls.
//!
//! ## Overview
//!
//! Callers create [`Conversation`]s from a [`Scheduler`], queue prompt or generated
//! tokens through them, and call [`Scheduler::infer`]. One `infer` call evaluates
//! everything queued so far in one evaluator call; afterwards every conversation
//! involved can read its logits and sample its next token.
//!
//! Conversations can be:
//!
//! - forked, branching into two independent futures that share a common prefix
//! - rewound, discarding recently generated tokens and their cache rows
//! - shifted left, dropping a window of old tokens to make room in the context
//! - saved to a file or to memory, and loaded back under a new sequence id
//!
//! ## Architecture
//!
//! ### Double-buffered batches
//!
//! The scheduler keeps two batches. `infer` swaps the filling batch out before it
//! suspends on the evaluator, so conversations keep queueing tokens for the next
//! call while an evaluation is in flight.
//!
//! ### Epochs
//!
//! An epoch counter advances once per successful evaluation. A conversation stamps
//! its queued tokens with the epoch they will be evaluated under and may sample once
//! the scheduler has moved past that stamp. No per-conversation locks are involved.
//!
//! ### Collaborators
//!
//! The scheduler never evaluates a model, stores attention tensors or picks tokens
//! itself. It drives an [`Evaluator`](backend::Evaluator), a
//! [`KvCache`](backend::KvCache) and, per call, a [`Sampler`](backend::Sampler).
//!
//! ## Example
//!
//! ```
//! use async_trait::async_trait;
//! use convoy::backend::{EvalStatus, Evaluator, GreedySampler, MemoryKvCache};
//! use convoy::core::batch::Batch;
//! use convoy::{CancellationToken, Scheduler, SchedulerConfig, Token};
//!
//! /// Always predicts `token + 1`.
//! struct Successor(std::sync::Mutex<Vec<Option<Vec<f32>>>>);
//!
//! #[async_trait]
//! impl Evaluator for Successor {
//!     async fn evaluate(&self, batch: &Batch) -> EvalStatus {
//!         let rows = batch
//!             .entries()
//!             .map(|entry| {
//!                 entry.wants_logits.then(|| {
//!                     let mut logits = vec![0.0; 32];
//!                     logits[(entry.token.0 + 1) as usize % 32] = 1.0;
//!                     logits
//!                 })
//!             })
//!             .collect();
//!         *self.0.lock().unwrap() = rows;
//!         EvalStatus::Ok
//!     }
//!
//!     fn read_logits(&self, index: usize) -> Option<Vec<f32>> {
//!         self.0.lock().unwrap().get(index).cloned().flatten()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> convoy::Result<()> {
//! let evaluator = Successor(Default::default());
//! let scheduler = Scheduler::new(evaluator, MemoryKvCache::new(), SchedulerConfig::default())?;
//!
//! let a = scheduler.create()?;
//! let b = scheduler.create()?;
//! a.prompt(&[Token(1), Token(2), Token(3)])?;
//! b.prompt(&[Token(10), Token(11)])?;
//!
//! // a single evaluator call for all five tokens
//! scheduler.infer(&CancellationToken::new()).await?;
//!
//! assert_eq!(a.sample(&mut GreedySampler)?, Token(4));
//! assert_eq!(b.sample(&mut GreedySampler)?, Token(12));
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **candle** - Enables an [`Evaluator`](backend::Evaluator) adapter for candle models
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events and installs no subscriber.
//!

pub mod backend;
pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod scheduler;
pub mod sequence;

pub use config::{SchedulerConfig, WorkerConfig};
pub use crate::core::Epoch;
pub use crate::core::worker::{InferWorker, WorkerHandle};
pub use error::{ErrorKind, Result, SchedulerError};
pub use scheduler::{Conversation, ConversationSnapshot, ConversationState, DecodeStatus, Scheduler};
pub use sequence::{Position, SequenceId, Token};
pub use tokio_util::sync::CancellationToken;
