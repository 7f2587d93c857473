//! Cycle scheduler & aggregation core
//!
//! One [`AggregatorContext`] value holds all the would-be global state
//! (committed state, authorized-operator verifier, role machine, counters)
//! and is threaded through all operations; there are no process-wide
//! singletons. The context is a pure state machine: frames and clock
//! readings go in, [`Outbound`] frames come out, and the thin [`run`] loop
//! at the bottom is the only place that touches a socket.
//!
//! ## Cycle pipeline
//!
//! Each tick closes the open cycle and opens the next one:
//!
//! 1. **close**: drain the backup's reorder window, decode if rank `m` was
//!    reached, apply the control law (or hold `x` on an undecodable cycle
//!    and escalate), then apply queued operator commits atomically.
//! 2. **open**: advance the cycle id, heartbeat to the peer, and, when
//!    Primary and not halted, derive and dispatch the cycle's coded tasks.
//!
//! Commits never apply mid-cycle: a task frame already in flight must be
//! evaluated against the same `(M, x, K)` it was issued under.
//!
//! ## Escalation ladder
//!
//! Rank below `m` at the deadline holds `x` and advances the cycle. Three
//! consecutive undecodable cycles enter degraded mode: the block budget is
//! halved (floor `m + 1`), the deadline doubles, and the heartbeat asks the
//! backup to re-forward observed results. Five consecutive enter the halt
//! state, which only an operator `Resume` commit leaves.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::auth::{AuthError, CommitVerifier, Directive, VerifiedCommit};
use crate::coded::{self, Decoder, Decoded, InsertOutcome};
use crate::fixed::{Matrix, Q31};
use crate::llft::{divergence_hash, Action, RoleMachine, SequencedWindow, REORDER_WINDOW};
use crate::metrics::CycleStats;
use crate::net::{Clock, Micros, NetError, UdpEndpoint};
use crate::wire::{BlockId, CommitToken, CycleId, Epoch, Frame, NodeId, Role};

/// Undecodable streak that enters degraded mode.
pub const DEGRADED_AFTER: u32 = 3;
/// Undecodable streak that enters the halt state.
pub const HALTED_AFTER: u32 = 5;
/// Cycles an unauthorized sender stays rate-limited.
pub const RATE_LIMIT_CYCLES: u64 = 10;
/// Synchronous-work budget as a fraction of the cycle: numerator.
pub const CPU_BUDGET_NUM: u64 = 3;
/// Synchronous-work budget as a fraction of the cycle: denominator.
pub const CPU_BUDGET_DEN: u64 = 10;

/// Fixed parameters of one aggregator node.
#[derive(Clone, Debug)]
pub struct AggregatorParams {
    pub node_id: NodeId,
    /// Control period `T_cycle`.
    pub t_cycle: Micros,
    /// Coded blocks per cycle, `K = ⌈m·(1+ρ)⌉`.
    pub k_blocks: u32,
    /// Role at startup.
    pub role: Role,
}

/// Operating mode along the escalation ladder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Halved block budget, doubled deadline, backup assist requested.
    Degraded,
    /// No dispatch until an operator `Resume` commit.
    Halted,
}

/// Control law applied to a decoded cycle output.
///
/// The trait is the seam for the plant-specific policy; the fabric only
/// requires that the returned input has width `n`.
pub trait ControlLaw {
    fn next_input(&self, x: &[Q31], y: &[Q31]) -> Vec<Q31>;
}

/// Closed-loop feedback: the decoded output becomes the next input.
/// Requires `m == n`; on mismatch the input holds.
pub struct FeedbackLaw;

impl ControlLaw for FeedbackLaw {
    fn next_input(&self, x: &[Q31], y: &[Q31]) -> Vec<Q31> {
        if y.len() == x.len() {
            y.to_vec()
        } else {
            x.to_vec()
        }
    }
}

/// Where an outbound frame goes; the run loop maps this to addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dest {
    Workers,
    Peer,
}

/// A frame the context wants on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub dest: Dest,
    pub frame: Frame,
}

fn to_peer(frame: Frame) -> Outbound {
    Outbound { dest: Dest::Peer, frame }
}

/// Fatal conditions; everything else recovers locally.
#[derive(Debug, thiserror::Error)]
pub enum AggError {
    #[error("internal invariant violation: {0}")]
    Invariant(String),
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Why [`run`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// A signed `Halt` commit was applied; exit code 0.
    Halted,
}

/// Per-cycle working state, retained one further cycle for late accounting.
pub struct CycleState {
    pub cycle_id: CycleId,
    /// Input snapshot every block of this cycle is evaluated against.
    pub x: Vec<Q31>,
    decoder: Decoder,
    pub decoded: Option<Decoded>,
    pub opened_at: Micros,
    pub deadline: Micros,
    pub dispatched: u32,
    pub late: u64,
}

impl CycleState {
    fn new(cycle_id: CycleId, x: Vec<Q31>, m: usize, opened_at: Micros, deadline: Micros) -> Self {
        CycleState {
            cycle_id,
            x,
            decoder: Decoder::new(m),
            decoded: None,
            opened_at,
            deadline,
            dispatched: 0,
            late: 0,
        }
    }
}

/// The aggregator: committed state, replication role, commit path, decoder.
pub struct AggregatorContext {
    params: AggregatorParams,
    matrix: Matrix,
    /// Committed input vector; the shadow mirror on a Backup.
    x: Vec<Q31>,
    cycle: CycleId,
    committed_epoch: Epoch,
    k_blocks: u32,
    role: RoleMachine,
    verifier: CommitVerifier,
    pending_commits: Vec<VerifiedCommit>,
    current: Option<CycleState>,
    prev: Option<CycleState>,
    mode: Mode,
    undecodable_streak: u32,
    halt_requested: bool,
    tamper_alerted: bool,
    control: Box<dyn ControlLaw>,
    node_sk: Option<SigningKey>,
    peer_vk: Option<VerifyingKey>,
    rate_limited: HashMap<u64, CycleId>,
    window: SequencedWindow<(u64, i64, u8)>,
    assist_active: bool,
    resync_requested_for: Option<CycleId>,
    hb_this_period: bool,
    pub stats: CycleStats,
}

impl AggregatorContext {
    /// Build a context over the bootstrap state.
    pub fn new(
        params: AggregatorParams,
        matrix: Matrix,
        x0: Vec<Q31>,
        verifier: CommitVerifier,
        control: Box<dyn ControlLaw>,
        node_sk: Option<SigningKey>,
        peer_vk: Option<VerifyingKey>,
    ) -> Result<Self, AggError> {
        if x0.len() != matrix.cols() {
            return Err(AggError::Invariant(format!(
                "bootstrap input width {} does not match matrix columns {}",
                x0.len(),
                matrix.cols()
            )));
        }
        if (params.k_blocks as usize) < matrix.rows() {
            return Err(AggError::Invariant(format!(
                "block budget {} below output width {}",
                params.k_blocks,
                matrix.rows()
            )));
        }
        let claim_wait = Micros(params.t_cycle.0 / 2);
        let role = RoleMachine::new(params.node_id, params.role, claim_wait);
        let k_blocks = params.k_blocks;
        Ok(AggregatorContext {
            params,
            matrix,
            x: x0,
            cycle: CycleId(0),
            committed_epoch: Epoch(0),
            k_blocks,
            role,
            verifier,
            pending_commits: Vec::new(),
            current: None,
            prev: None,
            mode: Mode::Normal,
            undecodable_streak: 0,
            halt_requested: false,
            tamper_alerted: false,
            control,
            node_sk,
            peer_vk,
            rate_limited: HashMap::new(),
            window: SequencedWindow::new(REORDER_WINDOW),
            assist_active: false,
            resync_requested_for: None,
            hb_this_period: false,
            stats: CycleStats::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    pub fn committed_epoch(&self) -> Epoch {
        self.committed_epoch
    }

    pub fn x(&self) -> &[Q31] {
        &self.x
    }

    pub fn halt_requested(&self) -> bool {
        self.halt_requested
    }

    /// Length of the running cycle (doubled while degraded).
    pub fn cycle_len(&self) -> Micros {
        match self.mode {
            Mode::Degraded => Micros(self.params.t_cycle.0 * 2),
            _ => self.params.t_cycle,
        }
    }

    /// Blocks to dispatch per cycle under the current mode.
    pub fn k_effective(&self) -> u32 {
        match self.mode {
            Mode::Degraded => (self.k_blocks / 2).max(self.matrix.rows() as u32 + 1),
            _ => self.k_blocks,
        }
    }

    /// When the next cycle tick is due.
    pub fn next_tick(&self) -> Micros {
        match &self.current {
            Some(c) => c.deadline,
            None => Micros(0),
        }
    }

    /// The 256-bit hash of the committed state, as heartbeats carry it.
    pub fn state_hash(&self) -> [u8; 32] {
        divergence_hash(self.cycle, &self.x, self.committed_epoch)
    }

    // ------------------------------------------------------------------
    // Cycle boundary
    // ------------------------------------------------------------------

    /// Close the open cycle and open the next one.
    pub fn on_cycle_tick(&mut self, now: Micros) -> Result<Vec<Outbound>, AggError> {
        let mut out = Vec::new();
        let hb_seen = self.hb_this_period;
        self.hb_this_period = false;

        if let Some(action) = self.role.on_period(now, self.committed_epoch, self.cycle) {
            match action {
                Action::BroadcastClaim(claim) => out.push(to_peer(Frame::ClaimPrimary {
                    cycle: claim.cycle,
                    committed_epoch: claim.committed_epoch,
                    node_id: claim.node,
                })),
                Action::BecomePrimary | Action::StepDown => {}
            }
        }

        // A heartbeat already drove this boundary on a Backup: the mirror
        // cycle is freshly open, so the tick must not rotate it again and
        // throw away its decoder.
        if !self.role.is_primary() && hb_seen {
            let fresh = self.current.as_ref().map_or(false, |c| {
                now.saturating_sub(c.opened_at).0 < self.cycle_len().0 / 2
            });
            if fresh {
                return Ok(out);
            }
        }

        self.close_cycle(now)?;
        // Backups estimate the primary's progress while it is silent; a
        // heartbeat resynchronizes the estimate exactly.
        if self.role.is_primary() || !hb_seen {
            self.cycle = self.cycle.next();
        }
        self.stats.cycles += 1;
        self.open_cycle(now, &mut out);
        Ok(out)
    }

    fn open_cycle(&mut self, now: Micros, out: &mut Vec<Outbound>) {
        let deadline = now.saturating_add(self.cycle_len());
        self.window.reset();
        self.resync_requested_for = None;
        let mut state =
            CycleState::new(self.cycle, self.x.clone(), self.matrix.rows(), now, deadline);

        if self.role.is_primary() {
            out.push(to_peer(Frame::Heartbeat {
                cycle: self.cycle,
                committed_epoch: self.committed_epoch,
                role: Role::Primary,
                assist: self.mode == Mode::Degraded,
                sender: self.params.node_id,
                state_hash: self.state_hash(),
            }));

            if self.mode != Mode::Halted {
                let k_eff = self.k_effective();
                for k in 0..k_eff {
                    let block_id = BlockId(k);
                    let seed = coded::block_seed(self.cycle, block_id);
                    out.push(Outbound {
                        dest: Dest::Workers,
                        frame: Frame::Task {
                            cycle: self.cycle,
                            block_id,
                            seed,
                            x: self.x.clone(),
                        },
                    });
                }
                state.dispatched = k_eff;
                self.stats.tasks_dispatched += k_eff as u64;
            }
        }
        self.current = Some(state);
    }

    fn close_cycle(&mut self, _now: Micros) -> Result<(), AggError> {
        let Some(mut cur) = self.current.take() else {
            return Ok(());
        };

        if !self.role.is_primary() {
            for (seq, (seed, y_acc, sat)) in self.window.drain_buffered() {
                Self::insert_result(
                    &mut cur,
                    &self.matrix,
                    BlockId(seq),
                    seed,
                    y_acc,
                    sat,
                    &mut self.stats,
                );
            }
        }
        if cur.decoder.ready() && cur.decoded.is_none() {
            self.decode_into(&mut cur);
        }

        match cur.decoded.as_ref() {
            Some(decoded) => {
                if decoded.tainted {
                    self.stats.tainted_decodes += 1;
                    tracing::warn!(
                        cycle = cur.cycle_id.as_u64(),
                        "decode delivered through a saturated basis"
                    );
                }
                let next = self.control.next_input(&cur.x, &decoded.y);
                if next.len() != self.matrix.cols() {
                    return Err(AggError::Invariant(format!(
                        "control law produced width {} for input width {}",
                        next.len(),
                        self.matrix.cols()
                    )));
                }
                self.x = next;
                self.undecodable_streak = 0;
                if self.mode == Mode::Degraded {
                    tracing::info!("decode recovered, leaving degraded mode");
                    self.mode = Mode::Normal;
                }
            }
            None if self.role.is_primary() && cur.dispatched > 0 => {
                self.stats.undecodable_cycles += 1;
                self.undecodable_streak += 1;
                tracing::warn!(
                    cycle = cur.cycle_id.as_u64(),
                    rank = cur.decoder.rank(),
                    need = cur.decoder.m(),
                    streak = self.undecodable_streak,
                    "undecodable cycle, holding input"
                );
                if self.undecodable_streak >= HALTED_AFTER {
                    self.mode = Mode::Halted;
                    tracing::error!(
                        "five consecutive undecodable cycles; halted until an operator resume"
                    );
                } else if self.undecodable_streak >= DEGRADED_AFTER && self.mode == Mode::Normal {
                    self.mode = Mode::Degraded;
                    tracing::warn!(
                        k = self.k_effective(),
                        "entering degraded mode: halved block budget, doubled deadline"
                    );
                }
            }
            None => {}
        }

        self.apply_pending_commits();

        self.stats.emit(cur.cycle_id);
        self.prev = Some(cur);
        Ok(())
    }

    fn decode_into(&mut self, cur: &mut CycleState) {
        let started = Instant::now();
        match cur.decoder.solve() {
            Ok(decoded) => {
                let us = started.elapsed().as_micros() as u64;
                self.stats.record_decode(us);
                let budget = self.cycle_len().0 * CPU_BUDGET_NUM / CPU_BUDGET_DEN;
                if us > budget {
                    self.stats.budget_overruns += 1;
                    tracing::warn!(us, budget, "decode exceeded the synchronous CPU budget");
                }
                tracing::debug!(
                    cycle = cur.cycle_id.as_u64(),
                    blocks = decoded.used.len(),
                    us,
                    "cycle decoded"
                );
                cur.decoded = Some(decoded);
            }
            Err(err) => {
                tracing::error!(cycle = cur.cycle_id.as_u64(), %err, "decode failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------

    /// Candidate promotion check; call freely between ticks.
    pub fn on_clock(&mut self, now: Micros) -> Vec<Outbound> {
        if let Some(Action::BecomePrimary) = self.role.on_clock(now) {
            tracing::warn!(
                node = self.params.node_id.as_u64(),
                cycle = self.cycle.as_u64(),
                "taking over as primary"
            );
        }
        Vec::new()
    }

    /// Process one inbound frame. `sender` is an opaque transport identity
    /// used only for rate limiting.
    pub fn on_frame(
        &mut self,
        frame: Frame,
        sender: u64,
        now: Micros,
    ) -> Result<Vec<Outbound>, AggError> {
        match frame {
            Frame::Result { cycle, block_id, seed, y_acc, sat_flag } => {
                Ok(self.on_result(cycle, block_id, seed, y_acc, sat_flag))
            }
            Frame::Heartbeat { cycle, committed_epoch, sender: from, state_hash, assist, .. } => {
                self.on_heartbeat(cycle, committed_epoch, from, state_hash, assist, now)
            }
            Frame::ClaimPrimary { cycle, committed_epoch, node_id } => {
                let claim = crate::llft::ClaimTuple { committed_epoch, cycle, node: node_id };
                let own = self.role.own_tuple(self.committed_epoch, self.cycle);
                if let Some(Action::StepDown) = self.role.on_claim(claim, own) {
                    tracing::warn!(claimant = node_id.as_u64(), "stepped down");
                }
                Ok(Vec::new())
            }
            Frame::Commit(token) => {
                self.on_commit(token, sender);
                Ok(Vec::new())
            }
            Frame::StateBlob { blob } => {
                match self.verifier.store_blob(&blob) {
                    Ok(hash) => {
                        tracing::info!(hash = %hex::encode(hash), "proposed state held")
                    }
                    Err(err) => tracing::warn!(%err, "rejected proposed-state blob"),
                }
                Ok(Vec::new())
            }
            Frame::Resync { cycle, committed_epoch, x, signature } => {
                self.on_resync(cycle, committed_epoch, x, signature, now);
                Ok(Vec::new())
            }
            Frame::ResyncRequest { node_id, .. } => Ok(self.on_resync_request(node_id)),
            // Aggregators are not task evaluators.
            Frame::Task { .. } => Ok(Vec::new()),
        }
    }

    fn on_result(
        &mut self,
        cycle: CycleId,
        block_id: BlockId,
        seed: u64,
        y_acc: i64,
        sat_flag: u8,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(cur_id) = self.current.as_ref().map(|c| c.cycle_id) else {
            self.stats.stale_dropped += 1;
            return out;
        };

        if cycle == cur_id {
            if coded::verify_seed(cycle, block_id, seed).is_err() {
                tracing::warn!(
                    cycle = cycle.as_u64(),
                    block = block_id.as_u32(),
                    "result frame with a foreign seed"
                );
                self.stats.stale_dropped += 1;
                return out;
            }
            if sat_flag != 0 {
                self.stats.saturated_blocks += 1;
            }
            if self.role.is_primary() {
                let cur = self.current.as_mut().expect("current cycle present");
                Self::insert_result(
                    cur,
                    &self.matrix,
                    block_id,
                    seed,
                    y_acc,
                    sat_flag,
                    &mut self.stats,
                );
            } else {
                if self.assist_active {
                    out.push(to_peer(Frame::Result { cycle, block_id, seed, y_acc, sat_flag }));
                }
                let before = self.window.dropped();
                let delivered = self.window.push(block_id.as_u32(), (seed, y_acc, sat_flag));
                self.stats.window_dropped += self.window.dropped() - before;
                let cur = self.current.as_mut().expect("current cycle present");
                for (seq, (seed, y_acc, sat)) in delivered {
                    Self::insert_result(
                        cur,
                        &self.matrix,
                        BlockId(seq),
                        seed,
                        y_acc,
                        sat,
                        &mut self.stats,
                    );
                }
            }
            let due = self
                .current
                .as_ref()
                .map_or(false, |c| c.decoder.ready() && c.decoded.is_none());
            if due {
                let mut cur = self.current.take().expect("current cycle present");
                self.decode_into(&mut cur);
                self.current = Some(cur);
            }
        } else if cycle.as_u64() + 1 == cur_id.as_u64() {
            self.stats.late_results += 1;
            if let Some(prev) = self.prev.as_mut() {
                prev.late += 1;
            }
        } else {
            self.stats.stale_dropped += 1;
        }
        out
    }

    fn insert_result(
        cur: &mut CycleState,
        matrix: &Matrix,
        block_id: BlockId,
        _seed: u64,
        y_acc: i64,
        sat_flag: u8,
        stats: &mut CycleStats,
    ) {
        let (_, coeffs) = coded::derive_block(cur.cycle_id, block_id, matrix.rows());
        match cur.decoder.insert(block_id, coeffs, y_acc, sat_flag) {
            InsertOutcome::Independent => stats.results_accepted += 1,
            InsertOutcome::Dependent => {
                stats.results_accepted += 1;
                stats.dependents += 1;
            }
            InsertOutcome::Duplicate => stats.duplicates += 1,
        }
    }

    fn on_heartbeat(
        &mut self,
        cycle: CycleId,
        epoch: Epoch,
        from: NodeId,
        state_hash: [u8; 32],
        assist: bool,
        now: Micros,
    ) -> Result<Vec<Outbound>, AggError> {
        let mut out = Vec::new();
        if self.role.is_primary() {
            // Two primaries cannot coexist; the claim rule resolves it, and
            // until then we ignore the peer's heartbeat.
            tracing::warn!(peer = from.as_u64(), "heartbeat from a second primary");
            return Ok(out);
        }
        self.role.on_heartbeat(from);
        self.hb_this_period = true;
        self.assist_active = assist;

        // The heartbeat is the cycle-boundary signal for the shadow: close
        // our mirror of the previous cycle, then align to the primary's id.
        self.close_cycle(now)?;
        self.cycle = cycle;
        self.stats.cycles += 1;
        let mut sink = Vec::new();
        self.open_cycle(now, &mut sink);

        let epoch_gap = epoch.as_u64().saturating_sub(self.committed_epoch.as_u64());
        let diverged = if epoch_gap > 1 {
            true
        } else {
            epoch == self.committed_epoch && self.state_hash() != state_hash
        };
        if diverged && self.resync_requested_for != Some(cycle) {
            self.resync_requested_for = Some(cycle);
            tracing::warn!(
                cycle = cycle.as_u64(),
                local_epoch = self.committed_epoch.as_u64(),
                primary_epoch = epoch.as_u64(),
                "shadow diverged, requesting resync"
            );
            out.push(to_peer(Frame::ResyncRequest {
                cycle,
                committed_epoch: self.committed_epoch,
                node_id: self.params.node_id,
            }));
        }
        Ok(out)
    }

    fn on_resync(
        &mut self,
        cycle: CycleId,
        epoch: Epoch,
        x: Vec<Q31>,
        signature: [u8; 64],
        now: Micros,
    ) {
        if self.role.is_primary() {
            return;
        }
        let Some(peer_vk) = self.peer_vk.as_ref() else {
            tracing::warn!("resync frame but no peer key provisioned");
            return;
        };
        if !crate::auth::verify_resync(peer_vk, cycle, epoch, &x, &signature) {
            tracing::warn!("resync frame with a bad signature");
            return;
        }
        if x.len() != self.matrix.cols() {
            tracing::warn!(got = x.len(), want = self.matrix.cols(), "resync width mismatch");
            return;
        }
        if epoch < self.committed_epoch {
            tracing::warn!("resync would regress the committed epoch; ignored");
            return;
        }
        self.stats.resyncs += 1;
        self.cycle = cycle;
        self.x = x;
        self.committed_epoch = epoch;
        let mut sink = Vec::new();
        self.open_cycle(now, &mut sink);
        tracing::info!(
            cycle = cycle.as_u64(),
            epoch = epoch.as_u64(),
            "shadow state resynced from primary"
        );
    }

    fn on_resync_request(&mut self, from: NodeId) -> Vec<Outbound> {
        if !self.role.is_primary() {
            return Vec::new();
        }
        let Some(sk) = self.node_sk.as_ref() else {
            tracing::warn!("resync requested but no node signing key provisioned");
            return Vec::new();
        };
        self.stats.resyncs += 1;
        tracing::info!(peer = from.as_u64(), "serving state resync");
        let signature = crate::auth::sign_resync(sk, self.cycle, self.committed_epoch, &self.x);
        vec![to_peer(Frame::Resync {
            cycle: self.cycle,
            committed_epoch: self.committed_epoch,
            x: self.x.clone(),
            signature,
        })]
    }

    // ------------------------------------------------------------------
    // Commit path
    // ------------------------------------------------------------------

    fn on_commit(&mut self, token: CommitToken, sender: u64) {
        if let Some(until) = self.rate_limited.get(&sender) {
            if self.cycle < *until {
                tracing::debug!(sender, "commit from a rate-limited sender dropped");
                return;
            }
            self.rate_limited.remove(&sender);
        }

        match self.verifier.verify(&token) {
            Ok(commit) => {
                tracing::info!(
                    sequence = commit.sequence,
                    "commit verified, queued for the cycle boundary"
                );
                self.pending_commits.push(commit);
            }
            Err(AuthError::UnauthorizedOperator) => {
                self.stats.unauthorized_rejected += 1;
                self.rate_limited
                    .insert(sender, CycleId(self.cycle.as_u64() + RATE_LIMIT_CYCLES));
                tracing::warn!(sender, "unauthorized operator key; sender rate-limited");
            }
            Err(AuthError::ReplayedOrStale { .. }) => {
                // Indistinguishable from a network replay; reject silently.
                self.stats.replays_rejected += 1;
            }
            Err(AuthError::BadSignature) => {
                self.stats.bad_signatures += 1;
                tracing::warn!("commit token with a bad signature");
                if self.verifier.tamper_alert() && !self.tamper_alerted {
                    self.tamper_alerted = true;
                    tracing::error!(
                        tampered = self.verifier.tamper_count(),
                        "tamper budget exhausted; operator intervention required"
                    );
                }
            }
            Err(AuthError::UnknownState { retransmit }) => {
                if retransmit {
                    tracing::warn!(
                        hash = %hex::encode(token.state_hash),
                        "commit references an unknown state; requesting retransmission"
                    );
                }
            }
            Err(err @ AuthError::MalformedBlob(_)) => {
                tracing::warn!(%err, "commit rejected");
            }
        }
    }

    fn apply_pending_commits(&mut self) {
        let pending = std::mem::take(&mut self.pending_commits);
        for commit in pending {
            match self.apply_commit(&commit) {
                Ok(()) => {
                    self.committed_epoch = self.committed_epoch.next();
                    self.stats.commits_applied += 1;
                    tracing::info!(
                        epoch = self.committed_epoch.as_u64(),
                        sequence = commit.sequence,
                        "commit applied at the cycle boundary"
                    );
                }
                Err(reason) => {
                    tracing::error!(sequence = commit.sequence, reason, "commit not applicable");
                }
            }
        }
    }

    /// Validate the whole commit against staged copies, then swap it in.
    fn apply_commit(&mut self, commit: &VerifiedCommit) -> Result<(), &'static str> {
        let mut matrix = self.matrix.clone();
        let mut x = self.x.clone();
        let mut k_blocks = self.k_blocks;
        let mut forced_role: Option<Role> = None;
        let mut halt = false;
        let mut resume = false;

        for d in &commit.state.directives {
            match d {
                Directive::ReplaceInput(new_x) => {
                    if new_x.len() != matrix.cols() {
                        return Err("input width does not match matrix columns");
                    }
                    x = new_x.clone();
                }
                Directive::ReplaceMatrix { rows, cols, elems } => {
                    if *rows == 0 || *cols == 0 {
                        return Err("matrix must be non-empty");
                    }
                    let m = Matrix::new_r(*rows as usize, *cols as usize, elems.clone())
                        .map_err(|_| "matrix element count does not match its shape")?;
                    if x.len() != m.cols() {
                        return Err("input width does not match the new matrix");
                    }
                    if (k_blocks as usize) < m.rows() {
                        k_blocks = m.rows() as u32;
                    }
                    matrix = m;
                }
                Directive::SetBlockCount(k) => {
                    if (*k as usize) < matrix.rows() {
                        return Err("block budget below the output width");
                    }
                    k_blocks = *k;
                }
                Directive::ForceRole { node, role } => {
                    if *node == self.params.node_id {
                        forced_role = Some(*role);
                    }
                }
                Directive::Halt => halt = true,
                Directive::Resume => resume = true,
            }
        }

        self.matrix = matrix;
        self.x = x;
        self.k_blocks = k_blocks;
        if let Some(role) = forced_role {
            self.role.force_role(role);
        }
        if resume {
            self.mode = Mode::Normal;
            self.undecodable_streak = 0;
            tracing::info!("operator resume; leaving halt/degraded state");
        }
        if halt {
            self.halt_requested = true;
        }
        Ok(())
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// Wire destinations for the run loop.
#[derive(Clone, Debug)]
pub struct WireTargets {
    pub peer: SocketAddr,
    pub workers: Vec<SocketAddr>,
}

fn send_all(
    endpoint: &UdpEndpoint,
    targets: &WireTargets,
    outbound: Vec<Outbound>,
) {
    for out in outbound {
        let dests: &[SocketAddr] = match out.dest {
            Dest::Peer => std::slice::from_ref(&targets.peer),
            Dest::Workers => &targets.workers,
        };
        for dest in dests {
            if let Err(err) = endpoint.send(&out.frame, *dest) {
                tracing::warn!(%dest, %err, "send failed");
            }
        }
    }
}

/// Single-threaded cooperative event loop: datagram poll bounded by the
/// cycle deadline, cycle ticks on the monotonic clock. Returns on a signed
/// halt; fatal invariant violations propagate as errors.
pub fn run(
    ctx: &mut AggregatorContext,
    endpoint: &UdpEndpoint,
    clock: &dyn Clock,
    targets: &WireTargets,
) -> Result<RunOutcome, AggError> {
    loop {
        let now = clock.now();
        if now >= ctx.next_tick() {
            let out = ctx.on_cycle_tick(now)?;
            send_all(endpoint, targets, out);
            if ctx.halt_requested() {
                tracing::info!("halt commit applied; exiting");
                return Ok(RunOutcome::Halted);
            }
        }
        let out = ctx.on_clock(clock.now());
        send_all(endpoint, targets, out);

        let now = clock.now();
        let until_tick = ctx.next_tick().saturating_sub(now);
        let poll_cap = Micros((ctx.cycle_len().0 / 8).max(1_000));
        let timeout = until_tick.min(poll_cap).to_duration();
        if let Some((frame, from)) = endpoint.poll(timeout)? {
            let out = ctx.on_frame(frame, crate::net::sender_key(&from), clock.now())?;
            send_all(endpoint, targets, out);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
