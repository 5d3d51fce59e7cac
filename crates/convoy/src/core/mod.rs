//! # Core Building Blocks
//!
//! The pieces the scheduler is assembled from.
//!
//! ## Module Structure
//!
//! * [`batch`] - The bounded batch accumulator handed to the evaluator.
//!
//! * `buffers` - The filling/idle pair of batches that lets new tokens be queued
//!   while a batch is being evaluated.
//!
//! * [`epoch`] - The version stamp advanced once per successful evaluation.
//!
//! * [`worker`] - Background task management. [`worker::InferWorker`] calls `infer`
//!   whenever a conversation queues tokens.
//!
pub mod batch;
pub(crate) mod buffers;
pub mod epoch;
pub mod worker;

pub use epoch::Epoch;
