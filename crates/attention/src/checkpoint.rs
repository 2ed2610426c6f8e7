//! Activation checkpointing with recompute-on-backward.
//!
//! [`checkpoint`] runs a closure on detached copies of its inputs, so none of
//! the closure's intermediates stay alive, and records the inputs, the closure
//! and a snapshot of the dropout random state on a [`CheckpointTape`]. The
//! returned tensor is a fresh leaf. [`CheckpointTape::backward`] first
//! differentiates the loss down to those leaves, then replays every recorded
//! closure in reverse order with the random state restored and differentiates
//! the recomputed output against the gradient that reached its leaf.
//!
//! Replaying from the snapshot reproduces the same dropout masks, so gradients
//! match an uncheckpointed run exactly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use candle_core::{Tensor, TensorId, Var};
use layers::{RngSnapshot, RngStateTracker};

use crate::core::AttentionError;

/// Closure recorded on a tape and replayed during the backward pass.
pub type CheckpointFn = Arc<dyn Fn(&[Tensor]) -> Result<Tensor, AttentionError> + Send + Sync>;

struct Record {
    inputs: Vec<Tensor>,
    snapshot: RngSnapshot,
    tracker: Arc<RngStateTracker>,
    func: CheckpointFn,
    output: Tensor,
}

/// Ordered list of checkpointed regions of one forward pass.
#[derive(Default)]
pub struct CheckpointTape {
    records: Mutex<Vec<Record>>,
}

impl fmt::Debug for CheckpointTape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointTape")
            .field("regions", &self.len())
            .finish()
    }
}

impl CheckpointTape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded regions.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gradients of `loss` with respect to each tensor in `wrt`.
    ///
    /// `wrt` entries must be variables (e.g. [`Var::as_tensor`]). Entries the
    /// loss does not depend on come back as `None`. The tape is consumed.
    pub fn backward(&self, loss: &Tensor, wrt: &[&Tensor]) -> Result<Vec<Option<Tensor>>, AttentionError> {
        let records = std::mem::take(&mut *self.lock()?);
        log::debug!("checkpoint backward: replaying {} region(s)", records.len());

        let mut targets: Vec<Tensor> = wrt.iter().map(|t| (*t).clone()).collect();
        targets.extend(records.iter().map(|r| r.output.clone()));

        let mut grads = Accumulator::default();
        grads.collect(&loss.backward()?, &targets)?;

        for record in records.iter().rev() {
            let Some(upstream) = grads.take(record.output.id()) else {
                continue;
            };
            let recomputed = record
                .tracker
                .replay(&record.snapshot, || (record.func)(&record.inputs))?;
            let surrogate = recomputed
                .mul(&upstream.to_dtype(recomputed.dtype())?.detach())?
                .sum_all()?;
            grads.collect(&surrogate.backward()?, &targets)?;
        }

        Ok(wrt.iter().map(|t| grads.take(t.id())).collect())
    }

    fn push(&self, record: Record) -> Result<(), AttentionError> {
        self.lock()?.push(record);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Record>>, AttentionError> {
        self.records.lock().map_err(|_| AttentionError::Backend {
            message: "checkpoint tape mutex poisoned".into(),
        })
    }
}

/// Runs `func` on `inputs` without retaining its intermediates and records it
/// on `tape` for recomputation.
pub fn checkpoint(
    tape: &CheckpointTape,
    tracker: Arc<RngStateTracker>,
    func: CheckpointFn,
    inputs: Vec<Tensor>,
) -> Result<Tensor, AttentionError> {
    let snapshot = tracker.snapshot()?;
    let detached: Vec<Tensor> = inputs.iter().map(Tensor::detach).collect();
    let output = func(&detached)?;
    let leaf = Var::from_tensor(&output)?.as_tensor().clone();
    tape.push(Record {
        inputs,
        snapshot,
        tracker,
        func,
        output: leaf.clone(),
    })?;
    Ok(leaf)
}

#[derive(Default)]
struct Accumulator {
    grads: HashMap<TensorId, Tensor>,
}

impl Accumulator {
    fn collect(&mut self, store: &candle_core::backprop::GradStore, targets: &[Tensor]) -> candle_core::Result<()> {
        for target in targets {
            if let Some(grad) = store.get(target) {
                let summed = match self.grads.remove(&target.id()) {
                    Some(existing) => existing.add(grad)?,
                    None => grad.clone(),
                };
                self.grads.insert(target.id(), summed);
            }
        }
        Ok(())
    }

    fn take(&mut self, id: TensorId) -> Option<Tensor> {
        self.grads.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::random::{dropout, DEFAULT_STREAM};
    use static_assertions::assert_impl_all;

    assert_impl_all!(CheckpointTape: Send, Sync);

    fn region(tracker: Arc<RngStateTracker>) -> CheckpointFn {
        Arc::new(move |inputs: &[Tensor]| -> Result<Tensor, AttentionError> {
            let hidden = inputs[0].matmul(&inputs[1])?.tanh()?;
            tracker.fork(DEFAULT_STREAM, |rng| -> Result<Tensor, AttentionError> {
                Ok(dropout(&hidden, 0.3, rng)?)
            })
        })
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn gradients_match_uncheckpointed_run_under_dropout() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let x = Var::randn(0f32, 1.0, (4, 6), &device)?;
        let w = Var::randn(0f32, 1.0, (6, 5), &device)?;
        let probe = Tensor::randn(0f32, 1.0, (4, 5), &device)?;

        let plain_tracker = Arc::new(RngStateTracker::new(9));
        let plain = region(plain_tracker)(&[x.as_tensor().clone(), w.as_tensor().clone()])?;
        let plain_loss = plain.mul(&probe)?.sum_all()?;
        let plain_grads = plain_loss.backward()?;

        let tracker = Arc::new(RngStateTracker::new(9));
        let tape = CheckpointTape::new();
        let out = checkpoint(
            &tape,
            tracker.clone(),
            region(tracker),
            vec![x.as_tensor().clone(), w.as_tensor().clone()],
        )?;
        assert_eq!(max_diff(&out, &plain)?, 0.0);
        assert_eq!(tape.len(), 1);

        let loss = out.mul(&probe)?.sum_all()?;
        let grads = tape.backward(&loss, &[x.as_tensor(), w.as_tensor()])?;
        assert!(tape.is_empty());
        for (var, grad) in [&x, &w].iter().zip(&grads) {
            let expected = plain_grads.get(var.as_tensor()).ok_or(AttentionError::Backend {
                message: "missing reference gradient".into(),
            })?;
            let got = grad.as_ref().ok_or(AttentionError::Backend {
                message: "missing checkpointed gradient".into(),
            })?;
            assert!(max_diff(got, expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn chained_regions_and_direct_paths_accumulate() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let x = Var::randn(0f32, 1.0, (3, 3), &device)?;
        let square: CheckpointFn = Arc::new(|inputs: &[Tensor]| -> Result<Tensor, AttentionError> {
            Ok(inputs[0].sqr()?)
        });

        let tracker = Arc::new(RngStateTracker::new(0));
        let tape = CheckpointTape::new();
        let first = checkpoint(&tape, tracker.clone(), square.clone(), vec![x.as_tensor().clone()])?;
        let second = checkpoint(&tape, tracker, square, vec![first.clone()])?;
        // loss = sum(x^4 + x)
        let loss = second.add(x.as_tensor())?.sum_all()?;
        let grads = tape.backward(&loss, &[x.as_tensor()])?;

        let xs = x.as_tensor();
        let expected = xs.sqr()?.mul(xs)?.affine(4.0, 1.0)?;
        let got = grads[0].as_ref().ok_or(AttentionError::Backend {
            message: "missing gradient".into(),
        })?;
        assert!(max_diff(got, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn unused_inputs_have_no_gradient() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let x = Var::ones((2, 2), DType::F32, &device)?;
        let unused = Var::ones((2, 2), DType::F32, &device)?;
        let tape = CheckpointTape::new();
        let identity: CheckpointFn = Arc::new(|inputs: &[Tensor]| -> Result<Tensor, AttentionError> {
            Ok(inputs[0].affine(2.0, 0.0)?)
        });
        let out = checkpoint(
            &tape,
            Arc::new(RngStateTracker::new(1)),
            identity,
            vec![x.as_tensor().clone()],
        )?;
        let grads = tape.backward(&out.sum_all()?, &[x.as_tensor(), unused.as_tensor()])?;
        assert!(grads[0].is_some());
        assert!(grads[1].is_none());
        Ok(())
    }
}
