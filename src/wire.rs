//! Binary wire codec (tagged positional frames)
//!
//! Every datagram on the control subnet is one frame: a one-byte type tag
//! followed by the frame's fields in declared order, fixed-width
//! little-endian integers, Q1.31 scalars as `i32` LE. There are no named
//! keys, no padding, no extensibility escape hatches: the set of frame types
//! is closed and dispatch over [`Frame`] is exhaustive.
//!
//! The `canonical_*` helpers produce the exact byte strings that are signed
//! or hashed elsewhere (PoA commits, resync frames, divergence hashes). They
//! concatenate fields in declared order with no tags and no padding; a
//! one-byte change anywhere changes the signature.
//!
//! Datagrams are capped at [`MAX_DATAGRAM`] bytes (mesh-safe under typical
//! 802.11s MTU); encoding an oversized frame is an error, not a truncation.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use crate::fixed::Q31;

/// Maximum encoded datagram size in bytes.
pub const MAX_DATAGRAM: usize = 1200;

// ============================================================================
// Protocol-wide index newtypes
// ============================================================================

/// Monotonic control-cycle identifier.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(pub u64);
impl CycleId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
    /// The cycle after this one.
    #[inline]
    pub fn next(self) -> CycleId {
        CycleId(self.0 + 1)
    }
}

/// Index of a coded block within a cycle; doubles as the per-cycle delivery
/// sequence for task/result traffic.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);
impl BlockId {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Opaque node identity (unique per participant, assigned by configuration).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);
impl NodeId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Monotonic counter of successfully applied PoA commits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);
impl Epoch {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
    #[inline]
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

/// Aggregator role, as carried in heartbeats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
    Candidate,
}

impl Role {
    fn to_u8(self) -> u8 {
        match self {
            Role::Primary => 0,
            Role::Backup => 1,
            Role::Candidate => 2,
        }
    }
    fn from_u8(v: u8) -> Option<Role> {
        match v {
            0 => Some(Role::Primary),
            1 => Some(Role::Backup),
            2 => Some(Role::Candidate),
            _ => None,
        }
    }
}

/// High bit of the heartbeat role byte: the primary is in degraded mode and
/// asks the backup to re-forward the result frames it has observed.
const ROLE_ASSIST_BIT: u8 = 0x80;

// ============================================================================
// Frames
// ============================================================================

/// A signed operator commit (verified in `auth`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommitToken {
    pub state_hash: [u8; 32],
    pub sequence: u64,
    pub verify_key: [u8; 32],
    pub signature: [u8; 64],
}

/// Every message that crosses the control subnet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Primary → workers: evaluate coded block `block_id` of `cycle` on `x`.
    Task { cycle: CycleId, block_id: BlockId, seed: u64, x: Vec<Q31> },
    /// Worker → both aggregators: the pre-shift dot accumulator of the block.
    Result { cycle: CycleId, block_id: BlockId, seed: u64, y_acc: i64, sat_flag: u8 },
    /// Primary → backup, at every cycle open.
    Heartbeat {
        cycle: CycleId,
        committed_epoch: Epoch,
        role: Role,
        assist: bool,
        sender: NodeId,
        state_hash: [u8; 32],
    },
    /// Candidate → all aggregators during promotion.
    ClaimPrimary { cycle: CycleId, committed_epoch: Epoch, node_id: NodeId },
    /// Operator → aggregators: a signed state transition.
    Commit(CommitToken),
    /// Primary → backup: authoritative state after a divergence.
    Resync { cycle: CycleId, committed_epoch: Epoch, x: Vec<Q31>, signature: [u8; 64] },
    /// Backup → primary: shadow state diverged, ship a resync.
    ResyncRequest { cycle: CycleId, committed_epoch: Epoch, node_id: NodeId },
    /// Operator → aggregators: preparatory proposed-state blob for a commit.
    StateBlob { blob: Vec<u8> },
}

const TAG_TASK: u8 = 0x01;
const TAG_RESULT: u8 = 0x02;
const TAG_HEARTBEAT: u8 = 0x03;
const TAG_CLAIM: u8 = 0x04;
const TAG_COMMIT: u8 = 0x05;
const TAG_RESYNC: u8 = 0x06;
const TAG_RESYNC_REQ: u8 = 0x07;
const TAG_STATE_BLOB: u8 = 0x08;

/// Errors surfaced by the codec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("encoded frame is {len} bytes, datagram cap is {MAX_DATAGRAM}")]
    Oversize { len: usize },
    #[error("scalar payload of {0} bytes is not a multiple of 4")]
    RaggedVector(usize),
    #[error("unknown role byte {0:#04x}")]
    BadRole(u8),
    #[error("empty datagram")]
    Empty,
}

impl Frame {
    /// Encode into a fresh datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(64);
        match self {
            Frame::Task { cycle, block_id, seed, x } => {
                out.push(TAG_TASK);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&block_id.0.to_le_bytes());
                out.extend_from_slice(&seed.to_le_bytes());
                write_q31s(&mut out, x);
            }
            Frame::Result { cycle, block_id, seed, y_acc, sat_flag } => {
                out.push(TAG_RESULT);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&block_id.0.to_le_bytes());
                out.extend_from_slice(&seed.to_le_bytes());
                out.extend_from_slice(&y_acc.to_le_bytes());
                out.push(*sat_flag);
            }
            Frame::Heartbeat { cycle, committed_epoch, role, assist, sender, state_hash } => {
                out.push(TAG_HEARTBEAT);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&committed_epoch.0.to_le_bytes());
                let mut rb = role.to_u8();
                if *assist {
                    rb |= ROLE_ASSIST_BIT;
                }
                out.push(rb);
                out.extend_from_slice(&sender.0.to_le_bytes());
                out.extend_from_slice(state_hash);
            }
            Frame::ClaimPrimary { cycle, committed_epoch, node_id } => {
                out.push(TAG_CLAIM);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&committed_epoch.0.to_le_bytes());
                out.extend_from_slice(&node_id.0.to_le_bytes());
            }
            Frame::Commit(t) => {
                out.push(TAG_COMMIT);
                out.extend_from_slice(&t.state_hash);
                out.extend_from_slice(&t.sequence.to_le_bytes());
                out.extend_from_slice(&t.verify_key);
                out.extend_from_slice(&t.signature);
            }
            Frame::Resync { cycle, committed_epoch, x, signature } => {
                out.push(TAG_RESYNC);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&committed_epoch.0.to_le_bytes());
                write_q31s(&mut out, x);
                out.extend_from_slice(signature);
            }
            Frame::ResyncRequest { cycle, committed_epoch, node_id } => {
                out.push(TAG_RESYNC_REQ);
                out.extend_from_slice(&cycle.0.to_le_bytes());
                out.extend_from_slice(&committed_epoch.0.to_le_bytes());
                out.extend_from_slice(&node_id.0.to_le_bytes());
            }
            Frame::StateBlob { blob } => {
                out.push(TAG_STATE_BLOB);
                out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
                out.extend_from_slice(blob);
            }
        }
        if out.len() > MAX_DATAGRAM {
            return Err(WireError::Oversize { len: out.len() });
        }
        Ok(out)
    }

    /// Decode a datagram payload.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let frame = match tag {
            TAG_TASK => {
                let cycle = CycleId(r.u64()?);
                let block_id = BlockId(r.u32()?);
                let seed = r.u64()?;
                let x = r.rest_q31s()?;
                Frame::Task { cycle, block_id, seed, x }
            }
            TAG_RESULT => {
                let cycle = CycleId(r.u64()?);
                let block_id = BlockId(r.u32()?);
                let seed = r.u64()?;
                let y_acc = r.i64()?;
                let sat_flag = r.u8()?;
                r.finish()?;
                Frame::Result { cycle, block_id, seed, y_acc, sat_flag }
            }
            TAG_HEARTBEAT => {
                let cycle = CycleId(r.u64()?);
                let committed_epoch = Epoch(r.u64()?);
                let rb = r.u8()?;
                let role = Role::from_u8(rb & !ROLE_ASSIST_BIT).ok_or(WireError::BadRole(rb))?;
                let assist = rb & ROLE_ASSIST_BIT != 0;
                let sender = NodeId(r.u64()?);
                let state_hash = r.array::<32>()?;
                r.finish()?;
                Frame::Heartbeat { cycle, committed_epoch, role, assist, sender, state_hash }
            }
            TAG_CLAIM => {
                let cycle = CycleId(r.u64()?);
                let committed_epoch = Epoch(r.u64()?);
                let node_id = NodeId(r.u64()?);
                r.finish()?;
                Frame::ClaimPrimary { cycle, committed_epoch, node_id }
            }
            TAG_COMMIT => {
                let state_hash = r.array::<32>()?;
                let sequence = r.u64()?;
                let verify_key = r.array::<32>()?;
                let signature = r.array::<64>()?;
                r.finish()?;
                Frame::Commit(CommitToken { state_hash, sequence, verify_key, signature })
            }
            TAG_RESYNC => {
                let cycle = CycleId(r.u64()?);
                let committed_epoch = Epoch(r.u64()?);
                // The signature trails the variable-width vector.
                let body = r.rest()?;
                if body.len() < 64 {
                    return Err(WireError::Truncated { need: 64, got: body.len() });
                }
                let (xs, sig) = body.split_at(body.len() - 64);
                let x = read_q31s(xs)?;
                let mut signature = [0u8; 64];
                signature.copy_from_slice(sig);
                Frame::Resync { cycle, committed_epoch, x, signature }
            }
            TAG_RESYNC_REQ => {
                let cycle = CycleId(r.u64()?);
                let committed_epoch = Epoch(r.u64()?);
                let node_id = NodeId(r.u64()?);
                r.finish()?;
                Frame::ResyncRequest { cycle, committed_epoch, node_id }
            }
            TAG_STATE_BLOB => {
                let len = r.u32()? as usize;
                let body = r.rest()?;
                if body.len() < len {
                    return Err(WireError::Truncated { need: len, got: body.len() });
                }
                if body.len() > len {
                    return Err(WireError::TrailingBytes(body.len() - len));
                }
                Frame::StateBlob { blob: body.to_vec() }
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(frame)
    }
}

// ============================================================================
// Canonical byte schedules (signing / hashing inputs)
// ============================================================================

/// Signed prefix of a commit token: `state_hash ∥ sequence`.
pub fn canonical_commit(state_hash: &[u8; 32], sequence: u64) -> [u8; 40] {
    let mut out = [0u8; 40];
    out[..32].copy_from_slice(state_hash);
    out[32..].copy_from_slice(&sequence.to_le_bytes());
    out
}

/// Signed prefix of a resync frame: `cycle ∥ committed_epoch ∥ x`.
pub fn canonical_resync(cycle: CycleId, epoch: Epoch, x: &[Q31]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + x.len() * 4);
    out.extend_from_slice(&cycle.0.to_le_bytes());
    out.extend_from_slice(&epoch.0.to_le_bytes());
    write_q31s(&mut out, x);
    out
}

/// Divergence-hash preimage: `cycle ∥ x ∥ committed_epoch`.
pub fn canonical_divergence(cycle: CycleId, x: &[Q31], epoch: Epoch) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + x.len() * 4);
    out.extend_from_slice(&cycle.0.to_le_bytes());
    write_q31s(&mut out, x);
    out.extend_from_slice(&epoch.0.to_le_bytes());
    out
}

/// Append a scalar slice as `i32` little-endian words.
pub fn write_q31s(out: &mut Vec<u8>, xs: &[Q31]) {
    for x in xs {
        out.extend_from_slice(&x.to_bits().to_le_bytes());
    }
}

/// Parse a byte slice as packed `i32` little-endian scalars.
pub fn read_q31s(buf: &[u8]) -> Result<Vec<Q31>, WireError> {
    if buf.len() % 4 != 0 {
        return Err(WireError::RaggedVector(buf.len()));
    }
    Ok(buf
        .chunks_exact(4)
        .map(|c| Q31::from_bits(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

// ============================================================================
// Internals
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            if self.buf.is_empty() {
                return Err(WireError::Empty);
            }
            return Err(WireError::Truncated { need: n, got: self.buf.len() - self.pos });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        Ok(self.u64()? as i64)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// All remaining bytes.
    fn rest(&mut self) -> Result<&'a [u8], WireError> {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        Ok(out)
    }

    /// All remaining bytes as packed scalars.
    fn rest_q31s(&mut self) -> Result<Vec<Q31>, WireError> {
        read_q31s(self.rest()?)
    }

    /// Assert the frame consumed the whole datagram.
    fn finish(&self) -> Result<(), WireError> {
        if self.pos != self.buf.len() {
            return Err(WireError::TrailingBytes(self.buf.len() - self.pos));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn q(bits: i32) -> Q31 {
        Q31::from_bits(bits)
    }

    #[test]
    fn task_round_trips() {
        let f = Frame::Task {
            cycle: CycleId(7),
            block_id: BlockId(3),
            seed: 0xdead_beef_cafe_f00d,
            x: vec![q(1), q(-1), q(i32::MAX)],
        };
        let buf = f.encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), f);
    }

    #[test]
    fn result_layout_is_fixed_width() {
        let f = Frame::Result {
            cycle: CycleId(1),
            block_id: BlockId(2),
            seed: 3,
            y_acc: -12345,
            sat_flag: 0b10,
        };
        let buf = f.encode().unwrap();
        assert_eq!(buf.len(), 1 + 8 + 4 + 8 + 8 + 1);
        assert_eq!(Frame::decode(&buf).unwrap(), f);
    }

    #[test]
    fn heartbeat_carries_role_and_assist() {
        let f = Frame::Heartbeat {
            cycle: CycleId(10),
            committed_epoch: Epoch(4),
            role: Role::Primary,
            assist: true,
            sender: NodeId(42),
            state_hash: [9u8; 32],
        };
        let buf = f.encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), f);
    }

    #[test]
    fn commit_and_claim_round_trip() {
        let t = CommitToken {
            state_hash: [1u8; 32],
            sequence: 5,
            verify_key: [2u8; 32],
            signature: [3u8; 64],
        };
        let buf = Frame::Commit(t).encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), Frame::Commit(t));

        let c = Frame::ClaimPrimary {
            cycle: CycleId(100),
            committed_epoch: Epoch(6),
            node_id: NodeId(2),
        };
        let buf = c.encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), c);
    }

    #[test]
    fn resync_round_trips_with_trailing_signature() {
        let f = Frame::Resync {
            cycle: CycleId(12),
            committed_epoch: Epoch(2),
            x: vec![q(5), q(-6)],
            signature: [7u8; 64],
        };
        let buf = f.encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), f);
    }

    #[test]
    fn state_blob_round_trips() {
        let f = Frame::StateBlob { blob: vec![1, 2, 3, 4, 5] };
        let buf = f.encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), f);
    }

    #[test]
    fn unknown_tag_and_truncation_are_rejected() {
        assert_eq!(Frame::decode(&[0xff, 0, 0]), Err(WireError::UnknownTag(0xff)));
        assert!(matches!(
            Frame::decode(&[TAG_RESULT, 1, 2]),
            Err(WireError::Truncated { .. })
        ));
        assert_eq!(Frame::decode(&[]), Err(WireError::Empty));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut buf = Frame::ClaimPrimary {
            cycle: CycleId(1),
            committed_epoch: Epoch(1),
            node_id: NodeId(1),
        }
        .encode()
        .unwrap();
        buf.push(0);
        assert_eq!(Frame::decode(&buf), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn oversized_task_is_refused() {
        let f = Frame::Task {
            cycle: CycleId(0),
            block_id: BlockId(0),
            seed: 0,
            x: vec![Q31::ZERO; 400],
        };
        assert!(matches!(f.encode(), Err(WireError::Oversize { .. })));
    }

    #[test]
    fn ragged_scalar_payload_is_refused() {
        let mut buf = Vec::new();
        buf.push(TAG_TASK);
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(Frame::decode(&buf), Err(WireError::RaggedVector(3)));
    }

    #[test]
    fn canonical_commit_layout() {
        let c = canonical_commit(&[0xaa; 32], 0x0102_0304_0506_0708);
        assert_eq!(&c[..32], &[0xaa; 32]);
        assert_eq!(&c[32..], &0x0102_0304_0506_0708u64.to_le_bytes());
    }
}
