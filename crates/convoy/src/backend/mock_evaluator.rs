use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{EvalStatus, Evaluator};
use crate::core::batch::Batch;
use crate::sequence::{Position, SequenceId, Token};

/// One row as the mock saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRow {
    pub token: Token,
    pub position: Position,
    pub sequences: Vec<SequenceId>,
    pub wants_logits: bool,
}

/// Lets a test hold an evaluation open.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

// A scriptable evaluator for testing.
//
// Statuses are popped from the script per call, defaulting to `Ok`. Logits for a row
// peak at `(token + 1) % vocab`, so a greedy sampler always continues with the next
// token id.
#[derive(Debug)]
pub struct MockEvaluator {
    vocab: usize,
    script: Mutex<VecDeque<EvalStatus>>,
    calls: Mutex<Vec<Vec<RecordedRow>>>,
    last_logits: Mutex<Vec<Option<Vec<f32>>>>,
    gate: Option<Gate>,
}

impl MockEvaluator {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(vec![]),
            last_logits: Mutex::new(vec![]),
            gate: None,
        }
    }

    pub fn gated(vocab: usize, gate: Gate) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(vocab)
        }
    }

    /// Queue statuses for the next calls.
    pub fn script(&self, statuses: impl IntoIterator<Item = EvalStatus>) {
        self.script.lock().extend(statuses);
    }

    /// Every batch seen so far, including ones that failed.
    pub fn calls(&self) -> Vec<Vec<RecordedRow>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn logits_for(vocab: usize, token: Token) -> Vec<f32> {
        let mut logits = vec![0.0; vocab];
        let peak = (token.0 + 1).rem_euclid(vocab as i32) as usize;
        logits[peak] = 1.0;
        logits
    }
}

#[async_trait]
impl Evaluator for MockEvaluator {
    async fn evaluate(&self, batch: &Batch) -> EvalStatus {
        let rows: Vec<RecordedRow> = batch
            .entries()
            .map(|entry| RecordedRow {
                token: entry.token,
                position: entry.position,
                sequences: entry.sequences.to_vec(),
                wants_logits: entry.wants_logits,
            })
            .collect();
        self.calls.lock().push(rows.clone());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let status = self.script.lock().pop_front().unwrap_or(EvalStatus::Ok);
        if status == EvalStatus::Ok {
            *self.last_logits.lock() = rows
                .iter()
                .map(|row| row.wants_logits.then(|| Self::logits_for(self.vocab, row.token)))
                .collect();
        }
        status
    }

    fn read_logits(&self, index: usize) -> Option<Vec<f32>> {
        self.last_logits.lock().get(index).cloned().flatten()
    }
}
