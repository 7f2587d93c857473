//! Leader/backup fast failover (LLFT)
//!
//! Replication discipline for the aggregator pair: exactly one Primary is
//! intended per cycle, zero is tolerated for at most one cycle, and a failed
//! Primary costs at most `F·T_cycle + T_cycle/2` of control-loop time.
//!
//! The pieces are deliberately pure state machines. Time enters only as
//! [`Micros`](crate::net::Micros) values handed to the event methods, frames
//! enter as already-decoded values, and decisions leave as [`Action`]s for
//! the caller to put on the wire. That keeps every transition unit-testable
//! with a manual clock and in-memory frames.
//!
//! - [`RoleMachine`]: heartbeat miss counting (`F = 3` promotes), claim
//!   broadcasting, highest-`(committed_epoch, cycle, node_id)`-tuple wins,
//!   immediate yield on a strictly higher claim.
//! - [`SequencedWindow`]: bounded reorder buffer (`W = 64`) delivering
//!   strictly in per-cycle sequence order; outside-window frames are dropped
//!   and counted.
//! - [`divergence_hash`]: the 256-bit digest of `(cycle, x,
//!   committed_epoch)` that heartbeats carry and the Backup's shadow mirror
//!   recomputes to detect drift.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::fixed::Q31;
use crate::net::Micros;
use crate::wire::{self, CycleId, Epoch, NodeId, Role};

/// Consecutive missed heartbeats before a Backup stands for promotion.
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Reorder-window width for per-cycle sequenced delivery.
pub const REORDER_WINDOW: u32 = 64;

/// Promotion-claim ranking: higher tuple wins, `node_id` breaks ties.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClaimTuple {
    pub committed_epoch: Epoch,
    pub cycle: CycleId,
    pub node: NodeId,
}

/// Wire-bound decisions a role transition produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Broadcast our claim and start the claim timer.
    BroadcastClaim(ClaimTuple),
    /// We won the claim window: start emitting tasks next cycle.
    BecomePrimary,
    /// Yield to a strictly higher claimant; stop emitting tasks immediately.
    StepDown,
}

/// Role state machine for one aggregator node.
#[derive(Debug)]
pub struct RoleMachine {
    node: NodeId,
    role: Role,
    claim_wait: Micros,
    missed: u32,
    heartbeat_seen: bool,
    my_claim: Option<ClaimTuple>,
    claim_deadline: Option<Micros>,
}

impl RoleMachine {
    /// Start in `role`; `claim_wait` is the Candidate hold-off (`T_cycle/2`).
    pub fn new(node: NodeId, role: Role, claim_wait: Micros) -> Self {
        RoleMachine {
            node,
            role,
            claim_wait,
            missed: 0,
            heartbeat_seen: false,
            my_claim: None,
            claim_deadline: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Our own ranking tuple at the current position in the stream.
    pub fn own_tuple(&self, epoch: Epoch, cycle: CycleId) -> ClaimTuple {
        ClaimTuple { committed_epoch: epoch, cycle, node: self.node }
    }

    /// A live Primary spoke. Resets the miss counter and cancels any
    /// candidacy of ours (an alive leader outranks a timeout suspicion).
    pub fn on_heartbeat(&mut self, from: NodeId) {
        if from == self.node {
            return;
        }
        self.heartbeat_seen = true;
        self.missed = 0;
        if self.role == Role::Candidate {
            tracing::info!(node = self.node.as_u64(), "candidate stands down, leader is alive");
            self.role = Role::Backup;
            self.my_claim = None;
            self.claim_deadline = None;
        }
    }

    /// One heartbeat period elapsed. Backups count misses and stand for
    /// promotion at the limit.
    pub fn on_period(&mut self, now: Micros, epoch: Epoch, cycle: CycleId) -> Option<Action> {
        match self.role {
            Role::Primary | Role::Candidate => None,
            Role::Backup => {
                if self.heartbeat_seen {
                    self.heartbeat_seen = false;
                    self.missed = 0;
                    return None;
                }
                self.missed += 1;
                tracing::debug!(
                    node = self.node.as_u64(),
                    missed = self.missed,
                    "heartbeat period elapsed without a heartbeat"
                );
                if self.missed < HEARTBEAT_MISS_LIMIT {
                    return None;
                }
                let claim = self.own_tuple(epoch, cycle);
                self.role = Role::Candidate;
                self.my_claim = Some(claim);
                self.claim_deadline = Some(Micros(now.0 + self.claim_wait.0));
                tracing::warn!(
                    node = self.node.as_u64(),
                    cycle = cycle.as_u64(),
                    "heartbeat timeout, standing for promotion"
                );
                Some(Action::BroadcastClaim(claim))
            }
        }
    }

    /// Clock check, callable at any poll iteration: a Candidate whose claim
    /// window closed uncontested becomes Primary.
    pub fn on_clock(&mut self, now: Micros) -> Option<Action> {
        if self.role != Role::Candidate {
            return None;
        }
        let deadline = self.claim_deadline?;
        if now < deadline {
            return None;
        }
        self.role = Role::Primary;
        self.claim_deadline = None;
        self.missed = 0;
        tracing::warn!(node = self.node.as_u64(), "claim window closed, promoting");
        Some(Action::BecomePrimary)
    }

    /// A peer's claim arrived. `own` is our current ranking tuple.
    pub fn on_claim(&mut self, claim: ClaimTuple, own: ClaimTuple) -> Option<Action> {
        if claim.node == self.node {
            return None;
        }
        match self.role {
            Role::Primary => {
                if claim > own {
                    self.role = Role::Backup;
                    self.missed = 0;
                    self.heartbeat_seen = false;
                    tracing::warn!(
                        node = self.node.as_u64(),
                        claimant = claim.node.as_u64(),
                        "yielding primary to a higher claim"
                    );
                    Some(Action::StepDown)
                } else {
                    None
                }
            }
            Role::Candidate => {
                let mine = self.my_claim.unwrap_or(own);
                if claim > mine {
                    self.role = Role::Backup;
                    self.my_claim = None;
                    self.claim_deadline = None;
                    self.missed = 0;
                    Some(Action::StepDown)
                } else {
                    None
                }
            }
            Role::Backup => {
                // Someone else is promoting; our miss counter restarts so we
                // give the new leader a full window.
                self.missed = 0;
                None
            }
        }
    }

    /// Operator `ForceRole` commit: mandatory, bypasses the election.
    pub fn force_role(&mut self, role: Role) {
        tracing::warn!(node = self.node.as_u64(), ?role, "role forced by operator commit");
        self.role = role;
        self.missed = 0;
        self.my_claim = None;
        self.claim_deadline = None;
    }
}

// ============================================================================
// Ordered delivery
// ============================================================================

/// Bounded reorder buffer delivering strictly in-sequence items.
///
/// Sequencing is per cycle; the owner resets the window at every cycle open.
/// Items at or beyond `next + window` are dropped and counted, as are
/// duplicates and items below `next` (already delivered).
#[derive(Debug)]
pub struct SequencedWindow<T> {
    next: u32,
    window: u32,
    pending: BTreeMap<u32, T>,
    dropped: u64,
}

impl<T> SequencedWindow<T> {
    pub fn new(window: u32) -> Self {
        SequencedWindow { next: 0, window, pending: BTreeMap::new(), dropped: 0 }
    }

    /// Absorb `(seq, item)`; returns everything now deliverable, in order.
    pub fn push(&mut self, seq: u32, item: T) -> Vec<(u32, T)> {
        if seq < self.next || seq >= self.next.saturating_add(self.window) {
            self.dropped += 1;
            return Vec::new();
        }
        if self.pending.contains_key(&seq) {
            self.dropped += 1;
            return Vec::new();
        }
        self.pending.insert(seq, item);
        let mut out = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            out.push((self.next, item));
            self.next += 1;
        }
        out
    }

    /// Cycle boundary: hand out whatever is still buffered, in ascending
    /// sequence order, skipping the gaps. Lost datagrams must not starve the
    /// shadow decoder forever; ordering within the delivered stream holds.
    pub fn drain_buffered(&mut self) -> Vec<(u32, T)> {
        let mut out: Vec<(u32, T)> = Vec::with_capacity(self.pending.len());
        while let Some((seq, item)) = self.pending.pop_first() {
            out.push((seq, item));
        }
        out
    }

    /// Forget the cycle: sequence restarts at zero, buffered items vanish.
    pub fn reset(&mut self) {
        self.next = 0;
        self.pending.clear();
    }

    /// Frames dropped as duplicates or outside the window, ever.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Items buffered waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Shadow state & divergence detection
// ============================================================================

const DIVERGENCE_CTX: &str = "qfabric.divergence.v1";

/// 256-bit divergence hash over the canonical `(cycle, x, committed_epoch)`.
///
/// The Primary stamps this into every heartbeat; the Backup recomputes it
/// over its shadow mirror after closing the same cycle. A mismatch at equal
/// epochs means the mirrors disagree and a signed resync is needed.
pub fn divergence_hash(cycle: CycleId, x: &[Q31], epoch: Epoch) -> [u8; 32] {
    let mut h = blake3::Hasher::new_derive_key(DIVERGENCE_CTX);
    h.update(&wire::canonical_divergence(cycle, x, epoch));
    *h.finalize().as_bytes()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Micros {
        Micros(v * 1_000)
    }

    fn backup(node: u64) -> RoleMachine {
        RoleMachine::new(NodeId(node), Role::Backup, ms(50))
    }

    #[test]
    fn backup_promotes_after_exactly_three_misses() {
        let mut rm = backup(2);
        let e = Epoch(4);

        assert_eq!(rm.on_period(ms(100), e, CycleId(101)), None);
        assert_eq!(rm.on_period(ms(200), e, CycleId(102)), None);
        let action = rm.on_period(ms(300), e, CycleId(103));
        let claim = rm.own_tuple(e, CycleId(103));
        assert_eq!(action, Some(Action::BroadcastClaim(claim)));
        assert_eq!(rm.role(), Role::Candidate);
    }

    #[test]
    fn heartbeat_resets_the_miss_counter() {
        let mut rm = backup(2);
        let e = Epoch(0);
        rm.on_period(ms(100), e, CycleId(1));
        rm.on_period(ms(200), e, CycleId(2));
        rm.on_heartbeat(NodeId(1));
        assert_eq!(rm.on_period(ms(300), e, CycleId(3)), None);
        assert_eq!(rm.on_period(ms(400), e, CycleId(4)), None);
        assert_eq!(rm.role(), Role::Backup);
    }

    #[test]
    fn uncontested_candidate_promotes_after_the_claim_window() {
        let mut rm = backup(2);
        let e = Epoch(1);
        for t in 1..=3 {
            rm.on_period(ms(t * 100), e, CycleId(t));
        }
        assert_eq!(rm.role(), Role::Candidate);
        // Claim window is 50ms, opened at the 300ms period tick.
        assert_eq!(rm.on_clock(ms(320)), None);
        assert_eq!(rm.on_clock(ms(350)), Some(Action::BecomePrimary));
        assert!(rm.is_primary());
    }

    #[test]
    fn candidate_defers_to_a_higher_claim() {
        let mut rm = backup(2);
        let e = Epoch(1);
        for t in 1..=3 {
            rm.on_period(ms(t * 100), e, CycleId(t));
        }
        let own = rm.own_tuple(e, CycleId(3));
        let higher = ClaimTuple { committed_epoch: Epoch(2), cycle: CycleId(3), node: NodeId(9) };
        assert_eq!(rm.on_claim(higher, own), Some(Action::StepDown));
        assert_eq!(rm.role(), Role::Backup);
        // Timer restarted: promotion needs three fresh misses.
        assert_eq!(rm.on_period(ms(500), e, CycleId(5)), None);
    }

    #[test]
    fn primary_yields_only_to_a_strictly_higher_tuple() {
        let mut rm = RoleMachine::new(NodeId(5), Role::Primary, ms(50));
        let own = rm.own_tuple(Epoch(3), CycleId(40));

        let lower = ClaimTuple { committed_epoch: Epoch(2), cycle: CycleId(90), node: NodeId(1) };
        assert_eq!(rm.on_claim(lower, own), None);
        assert!(rm.is_primary());

        let higher = ClaimTuple { committed_epoch: Epoch(4), cycle: CycleId(10), node: NodeId(1) };
        assert_eq!(rm.on_claim(higher, own), Some(Action::StepDown));
        assert_eq!(rm.role(), Role::Backup);
    }

    #[test]
    fn at_most_one_primary_after_an_election_round() {
        // Both aggregators lose the leader and stand. The higher node id wins
        // the tie at equal (epoch, cycle); the loser returns to backup.
        let e = Epoch(7);
        let c = CycleId(50);
        let mut a = backup(1);
        let mut b = backup(2);
        for t in 1..=3 {
            a.on_period(ms(t * 100), e, c);
            b.on_period(ms(t * 100), e, c);
        }
        let claim_a = a.own_tuple(e, c);
        let claim_b = b.own_tuple(e, c);
        a.on_claim(claim_b, claim_a);
        b.on_claim(claim_a, claim_b);
        assert_eq!(a.role(), Role::Backup);
        assert_eq!(b.role(), Role::Candidate);

        assert_eq!(b.on_clock(ms(360)), Some(Action::BecomePrimary));
        let primaries =
            [&a, &b].iter().filter(|m| m.is_primary()).count();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn force_role_is_mandatory() {
        let mut rm = RoleMachine::new(NodeId(5), Role::Primary, ms(50));
        rm.force_role(Role::Backup);
        assert_eq!(rm.role(), Role::Backup);
    }

    #[test]
    fn window_delivers_strictly_in_order() {
        let mut w: SequencedWindow<&str> = SequencedWindow::new(4);
        assert_eq!(w.push(1, "b"), vec![]);
        assert_eq!(w.buffered(), 1);
        assert_eq!(w.push(0, "a"), vec![(0, "a"), (1, "b")]);
        assert_eq!(w.push(2, "c"), vec![(2, "c")]);
    }

    #[test]
    fn window_drops_out_of_window_and_duplicates() {
        let mut w: SequencedWindow<u8> = SequencedWindow::new(4);
        assert_eq!(w.push(7, 0), vec![]); // beyond next + window
        assert_eq!(w.dropped(), 1);
        w.push(1, 1);
        assert_eq!(w.push(1, 1), vec![]); // duplicate in the gap
        assert_eq!(w.dropped(), 2);
        w.push(0, 0);
        assert_eq!(w.push(0, 0), vec![]); // already delivered
        assert_eq!(w.dropped(), 3);
    }

    #[test]
    fn window_reset_restarts_the_cycle_sequence() {
        let mut w: SequencedWindow<u8> = SequencedWindow::new(4);
        w.push(0, 0);
        w.push(2, 2);
        w.reset();
        assert_eq!(w.buffered(), 0);
        assert_eq!(w.push(0, 9), vec![(0, 9)]);
    }

    #[test]
    fn boundary_drain_skips_gaps_in_order() {
        let mut w: SequencedWindow<u8> = SequencedWindow::new(8);
        w.push(3, 33);
        w.push(1, 11);
        assert_eq!(w.drain_buffered(), vec![(1, 11), (3, 33)]);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn divergence_hash_binds_every_component() {
        let x = vec![Q31::from_bits(10), Q31::from_bits(-3)];
        let base = divergence_hash(CycleId(5), &x, Epoch(2));
        assert_eq!(base, divergence_hash(CycleId(5), &x, Epoch(2)));
        assert_ne!(base, divergence_hash(CycleId(6), &x, Epoch(2)));
        assert_ne!(base, divergence_hash(CycleId(5), &x, Epoch(3)));
        let mut x2 = x.clone();
        x2[1] = Q31::from_bits(-4);
        assert_ne!(base, divergence_hash(CycleId(5), &x2, Epoch(2)));
    }
}
