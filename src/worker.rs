//! Worker-side task evaluation
//!
//! Workers are plain request/response nodes: they hold the system matrix
//! distributed at startup, regenerate each task's selector from `(cycle,
//! block_id)`, combine the selected rows under saturation, dot against the
//! task's `x`, and answer with the raw accumulator to every aggregator.
//! There is no cancellation channel; a worker learns a cycle is obsolete
//! when a task with a newer cycle id arrives, and simply never accepts an
//! older one again.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::net::SocketAddr;

use crate::coded::{self, CodedError};
use crate::fixed::Matrix;
use crate::net::{NetError, UdpEndpoint};
use crate::wire::{BlockId, CycleId, Frame};

/// Errors surfaced by a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Coded(#[from] CodedError),
    #[error(transparent)]
    Net(#[from] NetError),
}

/// One worker's whole state: the matrix and the newest cycle seen.
pub struct WorkerContext {
    matrix: Matrix,
    last_seen: CycleId,
    pub evaluated: u64,
    pub stale_dropped: u64,
}

impl WorkerContext {
    pub fn new(matrix: Matrix) -> Self {
        WorkerContext { matrix, last_seen: CycleId(0), evaluated: 0, stale_dropped: 0 }
    }

    pub fn last_seen(&self) -> CycleId {
        self.last_seen
    }

    /// Evaluate one task frame. `Ok(None)` means the task was stale or
    /// malformed and silently dropped; dimension errors are fatal because
    /// they mean this worker's matrix disagrees with the fleet's.
    pub fn on_task(
        &mut self,
        cycle: CycleId,
        block_id: BlockId,
        seed: u64,
        x: &[crate::fixed::Q31],
    ) -> Result<Option<Frame>, WorkerError> {
        if cycle < self.last_seen {
            self.stale_dropped += 1;
            tracing::debug!(
                cycle = cycle.as_u64(),
                newest = self.last_seen.as_u64(),
                "stale task dropped"
            );
            return Ok(None);
        }
        if coded::verify_seed(cycle, block_id, seed).is_err() {
            self.stale_dropped += 1;
            tracing::warn!(
                cycle = cycle.as_u64(),
                block = block_id.as_u32(),
                "task frame with a foreign seed"
            );
            return Ok(None);
        }
        self.last_seen = cycle;

        let eval = coded::evaluate_block(&self.matrix, x, cycle, block_id)?;
        self.evaluated += 1;
        Ok(Some(Frame::Result {
            cycle,
            block_id,
            seed: eval.seed,
            y_acc: eval.y_acc,
            sat_flag: eval.sat_flag,
        }))
    }
}

/// Worker loop: evaluate tasks, answer every aggregator.
pub fn run_worker(
    ctx: &mut WorkerContext,
    endpoint: &UdpEndpoint,
    aggregators: &[SocketAddr],
) -> Result<(), WorkerError> {
    loop {
        let Some((frame, from)) = endpoint.poll(std::time::Duration::from_millis(250))? else {
            continue;
        };
        let Frame::Task { cycle, block_id, seed, x } = frame else {
            continue;
        };
        if let Some(result) = ctx.on_task(cycle, block_id, seed, &x)? {
            for dest in aggregators {
                if let Err(err) = endpoint.send(&result, *dest) {
                    tracing::warn!(%dest, %err, "result send failed");
                }
            }
            tracing::trace!(
                cycle = cycle.as_u64(),
                block = block_id.as_u32(),
                %from,
                "task evaluated"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Q31;

    fn q(v: f64) -> Q31 {
        Q31::from_f64(v)
    }

    fn matrix() -> Matrix {
        Matrix::new(2, 2, vec![q(0.5), q(0.25), q(-0.25), q(0.125)])
    }

    #[test]
    fn task_produces_the_evaluated_result_frame() {
        let mut w = WorkerContext::new(matrix());
        let x = vec![q(0.5), q(-0.5)];
        let cycle = CycleId(3);
        let block = BlockId(1);
        let seed = coded::block_seed(cycle, block);

        let frame = w.on_task(cycle, block, seed, &x).unwrap().expect("result");
        let want = coded::evaluate_block(&matrix(), &x, cycle, block).unwrap();
        assert_eq!(
            frame,
            Frame::Result {
                cycle,
                block_id: block,
                seed: want.seed,
                y_acc: want.y_acc,
                sat_flag: want.sat_flag,
            }
        );
        assert_eq!(w.evaluated, 1);
    }

    #[test]
    fn cycles_never_run_backwards() {
        let mut w = WorkerContext::new(matrix());
        let x = vec![q(0.1), q(0.2)];

        let c5 = CycleId(5);
        w.on_task(c5, BlockId(0), coded::block_seed(c5, BlockId(0)), &x).unwrap();
        assert_eq!(w.last_seen(), c5);

        // An older cycle's task is obsolete and silently dropped.
        let c4 = CycleId(4);
        let out = w.on_task(c4, BlockId(0), coded::block_seed(c4, BlockId(0)), &x).unwrap();
        assert!(out.is_none());
        assert_eq!(w.stale_dropped, 1);

        // Same cycle, another block: still acceptable.
        let out = w.on_task(c5, BlockId(1), coded::block_seed(c5, BlockId(1)), &x).unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn foreign_seed_is_dropped() {
        let mut w = WorkerContext::new(matrix());
        let x = vec![q(0.1), q(0.2)];
        let out = w.on_task(CycleId(1), BlockId(0), 0xbad5eed, &x).unwrap();
        assert!(out.is_none());
        assert_eq!(w.stale_dropped, 1);
    }

    #[test]
    fn mismatched_input_width_is_fatal() {
        let mut w = WorkerContext::new(matrix());
        let x = vec![q(0.1)];
        let c = CycleId(1);
        let err = w.on_task(c, BlockId(0), coded::block_seed(c, BlockId(0)), &x);
        assert!(err.is_err());
    }
}
