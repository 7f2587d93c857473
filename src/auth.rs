//! Ed25519 Proof-of-Authority commit path
//!
//! Operator state transitions enter the fabric as two frames: a preparatory
//! [`Frame::StateBlob`](crate::wire::Frame) carrying the canonical encoding
//! of a [`ProposedState`], and a [`CommitToken`] whose `state_hash` is the
//! SHA-256 of that blob and whose signature covers
//! `canonical(state_hash ∥ sequence)`.
//!
//! [`CommitVerifier`] applies the four checks in order, first failure wins:
//!
//! 1. `verify_key` must be pre-provisioned (`UnauthorizedOperator`),
//! 2. `sequence` must be strictly beyond the last accepted sequence for that
//!    key (`ReplayedOrStale`; silent at the policy layer, indistinguishable
//!    from a network replay),
//! 3. the Ed25519 signature must verify (`BadSignature`, tamper-counted),
//! 4. the referenced blob must already be held (`UnknownState`; one
//!    retransmission request per hash).
//!
//! The per-key sequence register advances only when all four checks pass, so
//! an operator can re-send the same token after re-delivering a lost blob.
//! Verification is pure given the held blobs; the primary and the backup
//! verify independently and converge.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::fixed::Q31;
use crate::wire::{self, CommitToken, CycleId, Epoch, NodeId, Role};

/// Consecutive bad-signature budget before the fabric demands operator
/// intervention.
pub const DEFAULT_TAMPER_THRESHOLD: u32 = 8;

/// One operator-directed state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Replace the input vector at the next cycle boundary.
    ReplaceInput(Vec<Q31>),
    /// Replace the system matrix (renegotiates `m`/`n`).
    ReplaceMatrix {
        /// Output width `m`.
        rows: u32,
        /// Input width `n`.
        cols: u32,
        /// Row-major elements, `rows · cols` of them.
        elems: Vec<Q31>,
    },
    /// Set the number of coded blocks per cycle.
    SetBlockCount(u32),
    /// Force a node into a role (mandatory, overrides the state machine).
    ForceRole {
        /// Target node.
        node: NodeId,
        /// Role it must assume.
        role: Role,
    },
    /// Stop the aggregator gracefully (exit code 0).
    Halt,
    /// Leave the halted state and resume cycling.
    Resume,
}

/// A proposed state: the ordered directives one commit applies atomically.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProposedState {
    /// Directives, applied in order at the cycle boundary.
    pub directives: Vec<Directive>,
}

const DIR_REPLACE_INPUT: u8 = 1;
const DIR_REPLACE_MATRIX: u8 = 2;
const DIR_SET_BLOCK_COUNT: u8 = 3;
const DIR_FORCE_ROLE: u8 = 4;
const DIR_HALT: u8 = 5;
const DIR_RESUME: u8 = 6;

impl ProposedState {
    /// Canonical blob encoding: directive count, then each directive as a
    /// tag byte plus fixed-order little-endian fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(self.directives.len() as u8);
        for d in &self.directives {
            match d {
                Directive::ReplaceInput(x) => {
                    out.push(DIR_REPLACE_INPUT);
                    out.extend_from_slice(&(x.len() as u32).to_le_bytes());
                    wire::write_q31s(&mut out, x);
                }
                Directive::ReplaceMatrix { rows, cols, elems } => {
                    out.push(DIR_REPLACE_MATRIX);
                    out.extend_from_slice(&rows.to_le_bytes());
                    out.extend_from_slice(&cols.to_le_bytes());
                    wire::write_q31s(&mut out, elems);
                }
                Directive::SetBlockCount(k) => {
                    out.push(DIR_SET_BLOCK_COUNT);
                    out.extend_from_slice(&k.to_le_bytes());
                }
                Directive::ForceRole { node, role } => {
                    out.push(DIR_FORCE_ROLE);
                    out.extend_from_slice(&node.0.to_le_bytes());
                    out.push(match role {
                        Role::Primary => 0,
                        Role::Backup => 1,
                        Role::Candidate => 2,
                    });
                }
                Directive::Halt => out.push(DIR_HALT),
                Directive::Resume => out.push(DIR_RESUME),
            }
        }
        out
    }

    /// Decode a blob; rejects malformed or trailing bytes.
    pub fn decode(blob: &[u8]) -> Result<ProposedState, AuthError> {
        fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], AuthError> {
            if buf.len() < n {
                return Err(AuthError::MalformedBlob("truncated directive"));
            }
            let (head, tail) = buf.split_at(n);
            *buf = tail;
            Ok(head)
        }
        fn take_u32(buf: &mut &[u8]) -> Result<u32, AuthError> {
            let b = take(buf, 4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        let mut buf = blob;
        let count = *take(&mut buf, 1)?.first().unwrap_or(&0) as usize;
        let mut directives = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = take(&mut buf, 1)?[0];
            let d = match tag {
                DIR_REPLACE_INPUT => {
                    let len = take_u32(&mut buf)? as usize;
                    let raw = take(&mut buf, len * 4)?;
                    let x = wire::read_q31s(raw)
                        .map_err(|_| AuthError::MalformedBlob("ragged input vector"))?;
                    Directive::ReplaceInput(x)
                }
                DIR_REPLACE_MATRIX => {
                    let rows = take_u32(&mut buf)?;
                    let cols = take_u32(&mut buf)?;
                    let n = (rows as usize)
                        .checked_mul(cols as usize)
                        .ok_or(AuthError::MalformedBlob("matrix shape overflow"))?;
                    let raw = take(&mut buf, n * 4)?;
                    let elems = wire::read_q31s(raw)
                        .map_err(|_| AuthError::MalformedBlob("ragged matrix"))?;
                    Directive::ReplaceMatrix { rows, cols, elems }
                }
                DIR_SET_BLOCK_COUNT => Directive::SetBlockCount(take_u32(&mut buf)?),
                DIR_FORCE_ROLE => {
                    let b = take(&mut buf, 8)?;
                    let node = NodeId(u64::from_le_bytes([
                        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                    ]));
                    let role = match take(&mut buf, 1)?[0] {
                        0 => Role::Primary,
                        1 => Role::Backup,
                        2 => Role::Candidate,
                        _ => return Err(AuthError::MalformedBlob("unknown role")),
                    };
                    Directive::ForceRole { node, role }
                }
                DIR_HALT => Directive::Halt,
                DIR_RESUME => Directive::Resume,
                _ => return Err(AuthError::MalformedBlob("unknown directive tag")),
            };
            directives.push(d);
        }
        if !buf.is_empty() {
            return Err(AuthError::MalformedBlob("trailing bytes"));
        }
        Ok(ProposedState { directives })
    }

    /// SHA-256 over the canonical blob; the hash a token must reference.
    pub fn state_hash(&self) -> [u8; 32] {
        state_hash_of(&self.encode())
    }
}

/// SHA-256 of an already-encoded blob.
pub fn state_hash_of(blob: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(blob);
    h.finalize().into()
}

/// Errors from the commit path, each mapped to a policy by the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("operator key not in the authorized set")]
    UnauthorizedOperator,
    #[error("commit sequence {sequence} is not beyond {last}")]
    ReplayedOrStale {
        /// Sequence carried by the rejected token.
        sequence: u64,
        /// Last accepted sequence for that key.
        last: u64,
    },
    #[error("commit signature does not verify")]
    BadSignature,
    #[error("no proposed state held for the referenced hash")]
    UnknownState {
        /// True exactly once per hash: the caller should ask the operator
        /// channel to re-send the preparatory blob.
        retransmit: bool,
    },
    #[error("malformed proposed-state blob: {0}")]
    MalformedBlob(&'static str),
}

/// A commit that passed all four checks, ready for boundary application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedCommit {
    /// The directives to apply.
    pub state: ProposedState,
    /// Key that authorized the transition.
    pub verify_key: [u8; 32],
    /// Accepted sequence number.
    pub sequence: u64,
}

/// Stateful commit verifier: authorized set, per-key sequence registers,
/// held preparatory blobs, tamper accounting.
pub struct CommitVerifier {
    authorized: HashMap<[u8; 32], VerifyingKey>,
    last_seq: HashMap<[u8; 32], u64>,
    pending: HashMap<[u8; 32], ProposedState>,
    retransmit_asked: HashSet<[u8; 32]>,
    tamper_count: u32,
    tamper_threshold: u32,
}

impl CommitVerifier {
    /// Build from the pre-provisioned operator keys. The set is read-only for
    /// the life of the verifier.
    pub fn new(keys: impl IntoIterator<Item = VerifyingKey>) -> Self {
        let authorized = keys.into_iter().map(|k| (k.to_bytes(), k)).collect();
        CommitVerifier {
            authorized,
            last_seq: HashMap::new(),
            pending: HashMap::new(),
            retransmit_asked: HashSet::new(),
            tamper_count: 0,
            tamper_threshold: DEFAULT_TAMPER_THRESHOLD,
        }
    }

    /// Number of authorized operator keys.
    pub fn authorized_count(&self) -> usize {
        self.authorized.len()
    }

    /// Hold a preparatory blob until a token references it.
    pub fn store_blob(&mut self, blob: &[u8]) -> Result<[u8; 32], AuthError> {
        let state = ProposedState::decode(blob)?;
        let hash = state_hash_of(blob);
        self.pending.insert(hash, state);
        Ok(hash)
    }

    /// Run the four checks. The sequence register advances only on success.
    pub fn verify(&mut self, token: &CommitToken) -> Result<VerifiedCommit, AuthError> {
        let vk = self
            .authorized
            .get(&token.verify_key)
            .ok_or(AuthError::UnauthorizedOperator)?;

        if let Some(&last) = self.last_seq.get(&token.verify_key) {
            if token.sequence <= last {
                return Err(AuthError::ReplayedOrStale { sequence: token.sequence, last });
            }
        }

        let msg = wire::canonical_commit(&token.state_hash, token.sequence);
        let sig = Signature::from_bytes(&token.signature);
        if vk.verify(&msg, &sig).is_err() {
            self.tamper_count += 1;
            return Err(AuthError::BadSignature);
        }

        let state = match self.pending.remove(&token.state_hash) {
            Some(s) => s,
            None => {
                let retransmit = self.retransmit_asked.insert(token.state_hash);
                return Err(AuthError::UnknownState { retransmit });
            }
        };

        self.last_seq.insert(token.verify_key, token.sequence);
        Ok(VerifiedCommit {
            state,
            verify_key: token.verify_key,
            sequence: token.sequence,
        })
    }

    /// Bad signatures seen so far.
    pub fn tamper_count(&self) -> u32 {
        self.tamper_count
    }

    /// True once the tamper budget is exhausted; the aggregator escalates to
    /// the operator channel.
    pub fn tamper_alert(&self) -> bool {
        self.tamper_count >= self.tamper_threshold
    }
}

/// Operator-side helper: produce a token for a proposed state.
///
/// Lives here so tooling and tests share one signing path with the verifier.
pub fn sign_commit(sk: &SigningKey, state_hash: [u8; 32], sequence: u64) -> CommitToken {
    let msg = wire::canonical_commit(&state_hash, sequence);
    let signature = sk.sign(&msg);
    CommitToken {
        state_hash,
        sequence,
        verify_key: sk.verifying_key().to_bytes(),
        signature: signature.to_bytes(),
    }
}

/// Sign a resync payload with the node key.
pub fn sign_resync(sk: &SigningKey, cycle: CycleId, epoch: Epoch, x: &[Q31]) -> [u8; 64] {
    sk.sign(&wire::canonical_resync(cycle, epoch, x)).to_bytes()
}

/// Verify a resync payload against a peer's node key.
pub fn verify_resync(
    vk: &VerifyingKey,
    cycle: CycleId,
    epoch: Epoch,
    x: &[Q31],
    signature: &[u8; 64],
) -> bool {
    let sig = Signature::from_bytes(signature);
    vk.verify(&wire::canonical_resync(cycle, epoch, x), &sig).is_ok()
}

// ============================================================================
// Tests
// ============================================================================
