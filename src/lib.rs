//! Crate root: public surface, core aliases, and protocol-wide invariants
//!
//! `qfabric` is a deterministic real-time control fabric for edge/mesh
//! deployments: a primary aggregator distributes a fixed-point
//! matrix-vector computation over an unreliable worker pool with a rateless
//! code, decodes the cycle output from any sufficient subset of answers,
//! replicates its committed state to a hot backup with bounded failover,
//! and accepts operator state transitions only under Ed25519
//! proof-of-authority.
//!
//! ## Invariants (protocol-wide)
//!
//! - **Determinism.** Every participant computes in saturating Q1.31 with
//!   truncation toward zero and exact 64-bit dot accumulation. Results are
//!   bit-identical across heterogeneous CPUs; nothing on the hot path
//!   touches floating point, FMA, or extended-precision intermediates.
//! - **Coded blocks are self-describing.** Block `k` of cycle `c` is fully
//!   determined by `(c, k)` through a keyed BLAKE3 derivation; selectors
//!   never cross the wire, and any rank-`m` subset of answers decodes the
//!   cycle bit-exactly (saturation-free basis).
//! - **One primary.** At most one node believes it is Primary at any
//!   instant, enforced by the heartbeat/claim discipline in [`llft`]; a
//!   failover costs at most `F·T_cycle + T_cycle/2`.
//! - **Commits are boundary-atomic.** A verified operator commit applies
//!   only between cycles, so every block of a cycle is evaluated against
//!   one consistent `(M, x, K)`. `committed_epoch` never regresses.
//!
//! Violations of these invariants are precise errors (the two fatal kinds
//! terminate with a diagnostic), never silent corruption.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Q1.31 saturating fixed-point engine (scalars, dot, matvec).
pub mod fixed;
/// Binary wire codec: tagged positional frames and canonical signing bytes.
pub mod wire;
/// Ed25519 proof-of-authority commit path.
pub mod auth;
/// Rateless coded-computing codec: encoder, rank-tracking decoder.
pub mod coded;
/// Leader/backup fast failover: roles, ordered delivery, shadow state.
pub mod llft;
/// Cycle scheduler and aggregation core.
pub mod aggregator;
/// Worker-side task evaluation.
pub mod worker;
/// Datagram transport and monotonic time.
pub mod net;
/// Startup configuration (keys, bootstrap state, addresses).
pub mod config;
/// Per-cycle counters and structured metric events.
pub mod metrics;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// The fabric's scalar. Everything numeric in the protocol is one of these.
pub type Q = fixed::Q31;

pub use crate::wire::{BlockId, CycleId, Epoch, NodeId, Role};

pub use crate::wire::MAX_DATAGRAM;

pub use crate::aggregator::{AggregatorContext, AggregatorParams, Mode, RunOutcome};
pub use crate::worker::WorkerContext;

pub use crate::fixed::{Matrix, Q31, SatCount};

pub use crate::wire::{CommitToken, Frame};
