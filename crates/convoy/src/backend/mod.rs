//! # Collaborators
//!
//! The scheduler never evaluates a model, stores attention state or picks tokens
//! itself. It drives three collaborators through the traits defined here:
//!
//! - [`Evaluator`] - the native batch evaluation routine, the only async seam
//! - [`KvCache`] - the shared key/value cache, addressed by sequence id and position
//! - [`Sampler`] - chooses the next token from a conversation's logits
//!
//! ## Provided implementations
//!
//! - [`MemoryKvCache`] - in-memory row bookkeeping
//! - [`GreedySampler`] - arg-max selection
//! - `CandleEvaluator` - adapts a candle model (`candle` feature)
//!
//! ## Feature Flags
//!
//! - `candle`: Enables the candle evaluator adapter

mod core_trait;
mod memory;
mod sampler;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Candle evaluator adapter.
///
/// This module is only available when the `candle` feature flag is enabled.
/// It turns a batch into rank-1 token and position tensors, runs a
/// [`CandleModel`](candle::CandleModel) and keeps the requested logit rows for the
/// scheduler to read back.
pub mod candle;

pub use core_trait::*;
pub use memory::MemoryKvCache;
pub use sampler::GreedySampler;

#[cfg(test)]
/// Scriptable evaluator used by the crate's tests.
pub(crate) mod mock_evaluator;
