use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;

use super::{EvalStatus, Evaluator};
use crate::core::batch::Batch;

/// Status code reported when a candle forward pass fails.
pub const CANDLE_FAILURE: i32 = -1;

/// A candle model that evaluates one flattened batch per call.
///
/// ## Input/Output Dimensions
///
/// `tokens` and `positions` are rank-1 `u32` tensors with one element per batch row.
/// The returned tensor has shape `(rows, vocab)`; only rows marked `wants_logits` are
/// read back. The full [`Batch`] is passed along for models that need the owning
/// sequence ids to address their own cache.
#[async_trait]
pub trait CandleModel: Send + Sync + 'static {
    async fn forward(
        &self,
        tokens: &Tensor,
        positions: &Tensor,
        batch: &Batch,
    ) -> candle_core::Result<Tensor>;
}

/// Adapts a [`CandleModel`] to the [`Evaluator`] interface.
pub struct CandleEvaluator<M> {
    model: M,
    device: Device,
    logits: Mutex<Vec<Option<Vec<f32>>>>,
}

impl<M> CandleEvaluator<M>
where
    M: CandleModel,
{
    pub fn new(model: M, device: Device) -> Self {
        Self {
            model,
            device,
            logits: Mutex::new(vec![]),
        }
    }

    fn inputs(&self, batch: &Batch) -> candle_core::Result<(Tensor, Tensor)> {
        let tokens = batch
            .tokens()
            .iter()
            .map(|t| {
                u32::try_from(t.0)
                    .map_err(|_| candle_core::Error::Msg(format!("token id {} is negative", t.0)))
            })
            .collect::<candle_core::Result<Vec<u32>>>()?;
        let positions: Vec<u32> = batch.positions().iter().map(|p| p.0).collect();
        Ok((
            Tensor::new(tokens.as_slice(), &self.device)?,
            Tensor::new(positions.as_slice(), &self.device)?,
        ))
    }

    fn capture(batch: &Batch, logits: &Tensor) -> candle_core::Result<Vec<Option<Vec<f32>>>> {
        let (rows, _vocab) = logits.dims2()?;
        if rows != batch.token_count() {
            return Err(candle_core::Error::Msg(format!(
                "model returned {} logit rows for a batch of {}",
                rows,
                batch.token_count()
            )));
        }
        let logits = logits.to_dtype(DType::F32)?;
        batch
            .logits()
            .iter()
            .enumerate()
            .map(|(row, wants)| {
                if *wants {
                    logits.get(row)?.to_vec1::<f32>().map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect()
    }
}

#[async_trait]
impl<M> Evaluator for CandleEvaluator<M>
where
    M: CandleModel,
{
    async fn evaluate(&self, batch: &Batch) -> EvalStatus {
        let (tokens, positions) = match self.inputs(batch) {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::error!(error = %e, "failed to build candle inputs");
                return EvalStatus::Error(CANDLE_FAILURE);
            }
        };

        let output = self.model.forward(&tokens, &positions, batch).await;
        match output.and_then(|logits| Self::capture(batch, &logits)) {
            Ok(captured) => {
                *self.logits.lock() = captured;
                EvalStatus::Ok
            }
            Err(e) => {
                tracing::error!(error = %e, rows = batch.token_count(), "candle forward failed");
                EvalStatus::Error(CANDLE_FAILURE)
            }
        }
    }

    fn read_logits(&self, index: usize) -> Option<Vec<f32>> {
        self.logits.lock().get(index).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Position, SequenceAllocator, Token};

    // Scores `token + 1` highest, like the mock evaluator.
    struct NextToken {
        vocab: usize,
    }

    #[async_trait]
    impl CandleModel for NextToken {
        async fn forward(&self, tokens: &Tensor, _positions: &Tensor, _batch: &Batch) -> candle_core::Result<Tensor> {
            let ids = tokens.to_vec1::<u32>()?;
            let mut data = vec![0f32; ids.len() * self.vocab];
            for (row, id) in ids.iter().enumerate() {
                data[row * self.vocab + (*id as usize + 1) % self.vocab] = 1.0;
            }
            Tensor::from_vec(data, (ids.len(), self.vocab), tokens.device())
        }
    }

    struct Broken;

    #[async_trait]
    impl CandleModel for Broken {
        async fn forward(&self, tokens: &Tensor, _positions: &Tensor, _batch: &Batch) -> candle_core::Result<Tensor> {
            // wrong row count
            Tensor::zeros((tokens.dim(0)? + 1, 4), DType::F32, tokens.device())
        }
    }

    fn batch() -> Batch {
        let seq = [SequenceAllocator::new(None).next().unwrap()];
        let mut batch = Batch::with_capacity(4);
        batch.append(Token(1), Position(0), &seq, false).unwrap();
        batch.append(Token(2), Position(1), &seq, true).unwrap();
        batch
    }

    #[tokio::test]
    async fn test_candle_evaluator_captures_requested_rows() {
        let evaluator = CandleEvaluator::new(NextToken { vocab: 5 }, Device::Cpu);
        assert_eq!(evaluator.evaluate(&batch()).await, EvalStatus::Ok);

        assert!(evaluator.read_logits(0).is_none());
        assert_eq!(evaluator.read_logits(1), Some(vec![0.0, 0.0, 0.0, 1.0, 0.0]));
    }

    #[tokio::test]
    async fn test_candle_evaluator_rejects_negative_tokens() {
        let seq = [SequenceAllocator::new(None).next().unwrap()];
        let mut batch = Batch::with_capacity(2);
        batch.append(Token(-3), Position(0), &seq, true).unwrap();

        let evaluator = CandleEvaluator::new(NextToken { vocab: 5 }, Device::Cpu);
        assert_eq!(evaluator.evaluate(&batch).await, EvalStatus::Error(CANDLE_FAILURE));
        assert!(evaluator.read_logits(0).is_none());
    }

    #[tokio::test]
    async fn test_candle_evaluator_reports_shape_mismatch() {
        let evaluator = CandleEvaluator::new(Broken, Device::Cpu);
        assert_eq!(evaluator.evaluate(&batch()).await, EvalStatus::Error(CANDLE_FAILURE));
        assert!(evaluator.read_logits(1).is_none());
    }
}
