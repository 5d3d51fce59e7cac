mod outcome_stream;

pub use outcome_stream::{InferOutcome, InferStatus, OutcomeStream};
pub(crate) use outcome_stream::OutcomeSubscribers;
