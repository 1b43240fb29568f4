//! The replica: message dispatch, concurrency control, the two-phase
//! agreement path, and the view-based fallback.
//!
//! This file contains the Phase-1/Phase-2/Writeback path, both OCC checks,
//! dependency waiting, and the fallback election machinery. Handlers run to
//! completion on a single loop; deferral happens only through
//! `Transport::timer`, which re-delivers the deferred message later.

use std::collections::{HashSet, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use super::state::ReplicaState;
use super::types::{
    Abort, Address, AttachedView, CcDecision, CcResult, CommitDecision, CommittedProof,
    CommittedValue, CurrentView, DecisionFb, Digest, ElectFb, ElectMessage, GroupConfig, GroupId,
    GroupedSignatures, InvokeFb, KeyManager, Message, OccType, Params, Partitioner, Phase1,
    Phase1Fb, Phase1FbReply, Phase1Reply, Phase2, Phase2Decision, Phase2Fb, Phase2FbReply,
    Phase2Reply, PreparedValue, ProcessId, ProofQuorum, Read, ReadReply, RelayP1, ReqId,
    SignedMessage, TimeSource, TimerEvent, Timestamp, Transaction, Transport, Value,
    VisibleWrite, Writeback,
};
use super::verify;
use super::wire;

/// Plain counters over protocol activity. The replica is single-threaded, so
/// these are ordinary integers snapshotted by value.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub cc_abstains: u64,
    pub cc_abstains_watermark: u64,
    pub cc_abstains_rw_conflict: u64,
    pub cc_abstains_wr_conflict: u64,
    pub cc_abstains_rts: u64,
    pub cc_abstains_dep: u64,
    pub cc_aborts: u64,
    pub cc_aborts_rw_conflict: u64,
    pub cc_aborts_wr_conflict: u64,
    pub cc_waits: u64,
    pub commits: u64,
    pub aborts: u64,
    pub fb_elect_votes: u64,
    pub fb_decisions_formed: u64,
    pub fb_decisions_adopted: u64,
    pub dropped: u64,
}

/// A single transactional replica within a shard group.
pub struct Replica {
    cfg: GroupConfig,
    group: GroupId,
    idx: usize,
    id: ProcessId,
    params: Params,
    transport: Arc<dyn Transport>,
    key_manager: Arc<dyn KeyManager>,
    partitioner: Arc<dyn Partitioner>,
    clock: Arc<dyn TimeSource>,
    genesis: Arc<CommittedProof>,
    state: ReplicaState,
    stats: Stats,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: GroupConfig,
        group: GroupId,
        idx: usize,
        params: Params,
        transport: Arc<dyn Transport>,
        key_manager: Arc<dyn KeyManager>,
        partitioner: Arc<dyn Partitioner>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let id = cfg.process_id(group, idx);
        Self {
            cfg,
            group,
            idx,
            id,
            params,
            transport,
            key_manager,
            partitioner,
            clock,
            genesis: Arc::new(CommittedProof::genesis()),
            state: ReplicaState::new(),
            stats: Stats::default(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Seed a committed value before execution begins. Loaded values carry a
    /// shared genesis proof.
    pub fn load(&mut self, key: &[u8], value: Vec<u8>, ts: Timestamp) {
        self.state.store.put(
            key,
            Value {
                data: value,
                proof: self.genesis.clone(),
            },
            ts,
        );
    }

    /// Single dispatch point for every inbound message.
    pub fn receive(&mut self, from: Address, msg: Message) {
        match msg {
            Message::Read(m) => self.handle_read(from, m),
            Message::Phase1(m) => self.handle_phase1(from, m),
            Message::Phase2(m) => self.handle_phase2(from, m),
            Message::Writeback(m) => self.handle_writeback(from, m),
            Message::Abort(m) => self.handle_abort(from, m),
            Message::Phase1Fb(m) => self.handle_phase1_fb(from, m),
            Message::Phase2Fb(m) => self.handle_phase2_fb(from, m),
            Message::InvokeFb(m) => self.handle_invoke_fb(from, m),
            Message::ElectFb(m) => self.handle_elect_fb(from, m),
            Message::DecisionFb(m) => self.handle_decision_fb(from, m),
            // Client-bound messages have no business arriving here; a
            // Byzantine peer must not be able to do more than waste them.
            Message::ReadReply(_)
            | Message::Phase1Reply(_)
            | Message::Phase2Reply(_)
            | Message::Phase1FbReply(_)
            | Message::Phase2FbReply(_)
            | Message::RelayP1(_) => {
                self.stats.dropped += 1;
                debug!(from = %from, "dropping client-bound message");
            }
        }
    }

    fn owns(&self, key: &[u8]) -> bool {
        self.partitioner.group_for(key, self.cfg.num_groups) == self.group
    }

    /// Ownership predicate detached from `self`, for use while state is
    /// mutably borrowed.
    fn key_filter(&self) -> impl Fn(&[u8]) -> bool {
        let partitioner = Arc::clone(&self.partitioner);
        let group = self.group;
        let num_groups = self.cfg.num_groups;
        move |key: &[u8]| partitioner.group_for(key, num_groups) == group
    }

    /// Timestamps strictly above localClock + timeDelta are rejected; a
    /// timestamp exactly at the watermark is served.
    fn beyond_high_watermark(&self, ts: Timestamp) -> bool {
        ts.time > self.clock.now() + self.params.time_delta
    }

    fn start_client_timer(&mut self, digest: &Digest) {
        if !self.state.client_starttime.contains_key(digest) {
            self.state
                .client_starttime
                .insert(digest.clone(), self.clock.now_ms());
        }
    }

    // -----------------------------------------------------------------------
    // Read.

    fn handle_read(&mut self, from: Address, msg: Read) {
        let ts = msg.timestamp;
        debug!(
            id = ts.id,
            req_id = msg.req_id,
            key = %wire::hex_prefix(&msg.key, 16),
            "READ"
        );
        if self.beyond_high_watermark(ts) {
            debug!("read timestamp beyond high watermark");
            self.stats.dropped += 1;
            return;
        }

        let mut reply = ReadReply {
            req_id: msg.req_id,
            key: msg.key.clone(),
            write: VisibleWrite::default(),
            proof: None,
            signed_write: None,
        };

        if let Some((version, value)) = self.state.store.get(&msg.key, ts) {
            reply.write.committed = Some(CommittedValue {
                value: value.data.clone(),
                timestamp: version,
            });
            if self.params.validate_proofs {
                reply.proof = Some(value.proof.as_ref().clone());
            }
        }

        if self.params.occ_type == OccType::Mvtso {
            // Record the read intent so subsequent writers observe it.
            self.state.rts.entry(msg.key.clone()).or_default().insert(ts);

            if self.params.max_dep_depth > -2 {
                self.attach_prepared_write(&msg.key, &mut reply);
            }
        }

        if self.params.validate_proofs
            && self.params.signed_messages
            && (reply.write.committed.is_some()
                || (self.params.verify_deps && reply.write.prepared.is_some()))
        {
            reply.signed_write =
                Some(self.sign_own(wire::encode_visible_write(&reply.key, &reply.write)));
        }

        self.transport.send(from, Message::ReadReply(reply));
    }

    /// Piggyback the most recent prepared write for `key`, depth permitting.
    fn attach_prepared_write(&self, key: &[u8], reply: &mut ReadReply) {
        let Some((prep_ts, writer_digest)) = self
            .state
            .prepared_writes
            .get(key)
            .and_then(|writers| writers.iter().next_back())
            .map(|(ts, digest)| (*ts, digest.clone()))
        else {
            return;
        };
        let Some(writer) = self.state.ongoing.get(&writer_digest) else {
            return;
        };
        if self.params.max_dep_depth >= 0
            && self.dependency_depth(writer) > self.params.max_dep_depth as u64
        {
            return;
        }
        let value = writer
            .write_set
            .iter()
            .find(|write| write.key == key)
            .map(|write| write.value.clone())
            .unwrap_or_default();
        reply.write.prepared = Some(PreparedValue {
            value,
            timestamp: prep_ts,
            txn_digest: writer_digest,
        });
    }

    /// Longest chain of in-flight dependencies below `txn`.
    fn dependency_depth(&self, txn: &Transaction) -> u64 {
        let mut max_depth = 0u64;
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut queue: VecDeque<(Digest, u64)> = txn
            .deps
            .iter()
            .map(|dep| (dep.write.txn_digest.clone(), 1))
            .collect();
        while let Some((digest, depth)) = queue.pop_front() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let Some(next) = self.state.ongoing.get(&digest) else {
                continue;
            };
            max_depth = max_depth.max(depth);
            for dep in &next.deps {
                queue.push_back((dep.write.txn_digest.clone(), depth + 1));
            }
        }
        max_depth
    }

    // -----------------------------------------------------------------------
    // Phase-1.

    fn handle_phase1(&mut self, from: Address, msg: Phase1) {
        let digest = wire::transaction_digest(&msg.txn, self.params.hash_digest);
        debug!(
            client = msg.txn.client_id,
            seq = msg.txn.client_seq,
            digest = %digest,
            ts = msg.txn.timestamp.time,
            "PHASE1"
        );

        // No-replay: recover the stored decision instead of re-running OCC.
        if let Some(result) = self.state.p1_decisions.get(&digest).copied() {
            self.state
                .interested_clients
                .entry(digest.clone())
                .or_default()
                .insert(from);
            if result != CcResult::Wait {
                let conflict = self.state.p1_conflicts.get(&digest).cloned();
                self.start_client_timer(&digest);
                self.send_phase1_reply(msg.req_id, &digest, result, conflict, from);
            }
            return;
        }

        if !self.deps_are_witnessed(&msg.txn, &digest) {
            return;
        }

        self.state.current_views.insert(digest.clone(), 0);
        self.state
            .interested_clients
            .entry(digest.clone())
            .or_default()
            .insert(from);

        let txn = msg.txn;
        let (result, conflict) = self.do_occ_check(msg.req_id, from, &digest, &txn);
        self.state.ongoing.insert(digest.clone(), txn);

        if result == CcResult::Wait {
            self.state.p1_decisions.insert(digest, CcResult::Wait);
        } else {
            self.start_client_timer(&digest);
            self.send_phase1_reply(msg.req_id, &digest, result, conflict, from);
        }
    }

    /// When dependencies must be signature-verified, reject transactions
    /// whose witnesses do not hold up. Safe to ignore: only a Byzantine
    /// client sends these.
    fn deps_are_witnessed(&mut self, txn: &Transaction, digest: &Digest) -> bool {
        if !(self.params.validate_proofs && self.params.signed_messages && self.params.verify_deps)
        {
            return true;
        }
        for dep in &txn.deps {
            if dep.write_sigs.is_empty() {
                debug!(digest = %digest, "dep missing signatures");
                self.stats.dropped += 1;
                return false;
            }
            if !verify::validate_dependency(dep, &self.cfg, &self.params, self.key_manager.as_ref())
            {
                debug!(digest = %digest, "dep validation failed");
                self.stats.dropped += 1;
                return false;
            }
        }
        true
    }

    fn do_occ_check(
        &mut self,
        req_id: ReqId,
        remote: Address,
        digest: &Digest,
        txn: &Transaction,
    ) -> (CcResult, Option<CommittedProof>) {
        match self.params.occ_type {
            OccType::Tapir => (self.do_tapir_check(digest, txn), None),
            OccType::Mvtso => self.do_mvtso_check(req_id, remote, digest, txn),
        }
    }

    /// The MVTSO check: scans of the committed and prepared indexes decide
    /// COMMIT / ABSTAIN / ABORT, then dependency waits may turn the outcome
    /// into WAIT.
    fn do_mvtso_check(
        &mut self,
        req_id: ReqId,
        remote: Address,
        digest: &Digest,
        txn: &Transaction,
    ) -> (CcResult, Option<CommittedProof>) {
        let ts = txn.timestamp;
        if self.beyond_high_watermark(ts) {
            debug!(digest = %digest, ts = ts.time, "ABSTAIN beyond high watermark");
            self.stats.cc_abstains += 1;
            self.stats.cc_abstains_watermark += 1;
            return (CcResult::Abstain, None);
        }

        for read in &txn.read_set {
            if !self.owns(&read.key) {
                continue;
            }
            // Committed write inside the read window: abort with proof.
            for (write_ts, value) in self.state.store.get_committed_after(&read.key, read.version)
            {
                if write_ts < ts {
                    self.stats.cc_aborts += 1;
                    self.stats.cc_aborts_wr_conflict += 1;
                    let conflict = self
                        .params
                        .validate_proofs
                        .then(|| value.proof.as_ref().clone());
                    debug!(
                        digest = %digest,
                        key = %wire::hex_prefix(&read.key, 16),
                        "ABORT wr conflict with committed write"
                    );
                    return (CcResult::Abort, conflict);
                }
            }
            // Prepared write inside the read window: abstain.
            if let Some(writers) = self.state.prepared_writes.get(&read.key) {
                if writers
                    .range((Bound::Excluded(read.version), Bound::Excluded(ts)))
                    .next()
                    .is_some()
                {
                    self.stats.cc_abstains += 1;
                    self.stats.cc_abstains_wr_conflict += 1;
                    debug!(
                        digest = %digest,
                        key = %wire::hex_prefix(&read.key, 16),
                        "ABSTAIN wr conflict with prepared write"
                    );
                    return (CcResult::Abstain, None);
                }
            }
        }

        for write in &txn.write_set {
            if !self.owns(&write.key) {
                continue;
            }
            // Committed reader that missed this write: abort with its proof.
            if let Some(readers) = self.state.committed_reads.get(&write.key) {
                for (commit_ts, read_ts, reader_digest) in readers.iter().rev() {
                    if ts >= *commit_ts {
                        // Readers are scanned from the largest commit
                        // timestamp down; everything below is older still.
                        break;
                    }
                    if *read_ts < ts {
                        self.stats.cc_aborts += 1;
                        self.stats.cc_aborts_rw_conflict += 1;
                        let conflict = if self.params.validate_proofs {
                            self.state
                                .committed
                                .get(reader_digest)
                                .map(|proof| proof.as_ref().clone())
                        } else {
                            None
                        };
                        debug!(
                            digest = %digest,
                            key = %wire::hex_prefix(&write.key, 16),
                            "ABORT rw conflict with committed read"
                        );
                        return (CcResult::Abort, conflict);
                    }
                }
            }
            // Prepared reader that missed this write and did not declare us
            // as a dependency: abstain.
            if let Some(readers) = self.state.prepared_reads.get(&write.key) {
                for reader_digest in readers {
                    let Some(reader) = self.state.ongoing.get(reader_digest) else {
                        continue;
                    };
                    let is_dep = reader
                        .deps
                        .iter()
                        .any(|dep| dep.write.txn_digest == *digest);
                    let Some(read_ts) = reader
                        .read_set
                        .iter()
                        .find(|read| read.key == write.key)
                        .map(|read| read.version)
                    else {
                        continue;
                    };
                    if !is_dep && read_ts < ts && ts < reader.timestamp {
                        self.stats.cc_abstains += 1;
                        self.stats.cc_abstains_rw_conflict += 1;
                        debug!(
                            digest = %digest,
                            key = %wire::hex_prefix(&write.key, 16),
                            "ABSTAIN rw conflict with prepared read"
                        );
                        return (CcResult::Abstain, None);
                    }
                }
            }
            // A reader strictly above our timestamp has already been served.
            if let Some(entries) = self.state.rts.get(&write.key) {
                if entries
                    .range((Bound::Excluded(ts), Bound::Unbounded))
                    .next()
                    .is_some()
                {
                    self.stats.cc_abstains += 1;
                    self.stats.cc_abstains_rts += 1;
                    debug!(
                        digest = %digest,
                        key = %wire::hex_prefix(&write.key, 16),
                        "ABSTAIN larger rts acquired"
                    );
                    return (CcResult::Abstain, None);
                }
            }
        }

        let owns = self.key_filter();
        self.state.prepare(digest, ts, txn, &owns);
        debug!(digest = %digest, ts = ts.time, "prepared");

        let mut all_finished = true;
        for dep in &txn.deps {
            if dep.involved_group != self.group {
                continue;
            }
            let dep_digest = &dep.write.txn_digest;
            if self.state.committed.contains_key(dep_digest)
                || self.state.aborted.contains(dep_digest)
            {
                continue;
            }
            // Without verified witnesses we only wait on dependencies we
            // prepared ourselves; anything else is a stale claim.
            if self.params.validate_proofs
                && self.params.signed_messages
                && !self.params.verify_deps
                && !self.state.prepared.contains_key(dep_digest)
            {
                self.stats.cc_abstains += 1;
                self.stats.cc_abstains_dep += 1;
                debug!(digest = %digest, dep = %dep_digest, "ABSTAIN stale dep");
                return (CcResult::Abstain, None);
            }
            // Relay the blocking transaction so the requester can drive a
            // fallback for it.
            if let Some(blocking) = self.state.ongoing.get(dep_digest) {
                let blocking = blocking.clone();
                self.relay_p1(remote, blocking, req_id);
            }
            debug!(digest = %digest, dep = %dep_digest, "WAIT for dependency");
            all_finished = false;
            self.state.add_waiting(digest, dep_digest, req_id, remote);
        }

        if !all_finished {
            self.stats.cc_waits += 1;
            return (CcResult::Wait, None);
        }
        let result = self.check_dependencies(txn);
        if result == CcResult::Abstain {
            self.stats.cc_abstains += 1;
            self.stats.cc_abstains_dep += 1;
        }
        (result, None)
    }

    /// Once every dependency is resolved: an aborted dependency or one that
    /// committed above our timestamp forces ABSTAIN, otherwise COMMIT.
    fn check_dependencies(&self, txn: &Transaction) -> CcResult {
        for dep in &txn.deps {
            if dep.involved_group != self.group {
                continue;
            }
            if self.state.committed.contains_key(&dep.write.txn_digest) {
                if dep.write.timestamp > txn.timestamp {
                    return CcResult::Abstain;
                }
            } else {
                return CcResult::Abstain;
            }
        }
        CcResult::Commit
    }

    /// The strict-OCC check. Retry timestamps are computed for observability
    /// but stay internal; the reply only carries the vote.
    fn do_tapir_check(&mut self, digest: &Digest, txn: &Transaction) -> CcResult {
        if let Some(&prep_ts) = self.state.prepared.get(digest) {
            if prep_ts == txn.timestamp {
                return CcResult::Commit;
            }
            // Re-run the checks for a new timestamp.
            if let Some(old) = self.state.ongoing.get(digest).cloned() {
                let owns = self.key_filter();
                self.state.clean_prepared(digest, &old, &owns);
            }
        }

        for read in &txn.read_set {
            let Some((low, high)) = self.state.store.get_range(&read.key, read.version) else {
                continue;
            };
            if low != read.version {
                continue;
            }
            match high {
                None => {
                    // Version still valid; a pending writer forces a retry.
                    if self
                        .state
                        .prepared_writes
                        .get(&read.key)
                        .is_some_and(|writers| !writers.is_empty())
                    {
                        self.stats.cc_abstains += 1;
                        self.stats.cc_abstains_rw_conflict += 1;
                        return CcResult::Abstain;
                    }
                }
                Some(next) => {
                    debug!(
                        digest = %digest,
                        superseded_at = next.time,
                        "ABORT read version superseded"
                    );
                    self.stats.cc_aborts += 1;
                    self.stats.cc_aborts_rw_conflict += 1;
                    return CcResult::Abort;
                }
            }
        }

        for write in &txn.write_set {
            if let Some((committed_ts, _)) = self.state.store.get_latest(&write.key) {
                if committed_ts > txn.timestamp {
                    debug!(digest = %digest, retry = committed_ts.time, "ABSTAIN ww conflict");
                    self.stats.cc_abstains += 1;
                    self.stats.cc_abstains_wr_conflict += 1;
                    return CcResult::Abstain;
                }
                if let Some(last_read) = self.state.store.get_last_read(&write.key) {
                    if last_read > txn.timestamp {
                        debug!(digest = %digest, retry = last_read.time, "ABSTAIN wr conflict");
                        self.stats.cc_abstains += 1;
                        self.stats.cc_abstains_wr_conflict += 1;
                        return CcResult::Abstain;
                    }
                }
            }
            if let Some(writers) = self.state.prepared_writes.get(&write.key) {
                if let Some((&retry, _)) = writers
                    .range((Bound::Excluded(txn.timestamp), Bound::Unbounded))
                    .next()
                {
                    debug!(digest = %digest, retry = retry.time, "ABSTAIN prepared ww conflict");
                    self.stats.cc_abstains += 1;
                    self.stats.cc_abstains_wr_conflict += 1;
                    return CcResult::Abstain;
                }
            }
            if let Some(readers) = self.state.prepared_reads.get(&write.key) {
                let blocked = readers.iter().any(|reader| {
                    self.state
                        .prepared
                        .get(reader)
                        .is_some_and(|&prep_ts| prep_ts > txn.timestamp)
                });
                if blocked {
                    self.stats.cc_abstains += 1;
                    self.stats.cc_abstains_rw_conflict += 1;
                    return CcResult::Abstain;
                }
            }
        }

        let owns = self.key_filter();
        self.state.prepare(digest, txn.timestamp, txn, &owns);
        CcResult::Commit
    }

    /// Persist the Phase-1 decision (and conflict proof for aborts).
    fn record_p1(&mut self, digest: &Digest, result: CcResult, conflict: &Option<CommittedProof>) {
        self.state.p1_decisions.insert(digest.clone(), result);
        if result == CcResult::Abort {
            if let Some(conflict) = conflict {
                self.state
                    .p1_conflicts
                    .insert(digest.clone(), conflict.clone());
            }
        }
    }

    fn make_phase1_reply(
        &self,
        req_id: ReqId,
        digest: &Digest,
        result: CcResult,
        conflict: Option<CommittedProof>,
    ) -> Phase1Reply {
        let mut cc = CcDecision {
            result,
            txn_digest: None,
            conflict: None,
        };
        let mut signed_cc = None;
        if self.params.validate_proofs {
            cc.txn_digest = Some(digest.clone());
            if result == CcResult::Abort {
                cc.conflict = conflict;
            } else if self.params.signed_messages {
                signed_cc = Some(self.sign_own(wire::encode_cc_vote(result, digest)));
            }
        }
        Phase1Reply {
            req_id,
            cc,
            signed_cc,
        }
    }

    fn send_phase1_reply(
        &mut self,
        req_id: ReqId,
        digest: &Digest,
        result: CcResult,
        conflict: Option<CommittedProof>,
        to: Address,
    ) {
        self.record_p1(digest, result, &conflict);
        let reply = self.make_phase1_reply(req_id, digest, result, conflict);
        self.transport.send(to, Message::Phase1Reply(reply));
    }

    /// Hand the requester the material to fall back for a blocking txn.
    fn relay_p1(&self, remote: Address, blocking: Transaction, conflict_id: ReqId) {
        let relay = RelayP1 {
            conflict_id,
            p1: Phase1 {
                req_id: 0,
                txn: blocking,
            },
        };
        self.transport.send(remote, Message::RelayP1(relay));
    }

    // -----------------------------------------------------------------------
    // Phase-2.

    fn handle_phase2(&mut self, from: Address, msg: Phase2) {
        let digest = match (&msg.txn_digest, &msg.txn) {
            (Some(digest), _) => digest.clone(),
            (None, Some(txn)) => wire::transaction_digest(txn, self.params.hash_digest),
            (None, None) => {
                debug!("PHASE2 carries neither digest nor txn");
                self.stats.dropped += 1;
                return;
            }
        };
        debug!(digest = %digest, decision = ?msg.decision, "PHASE2");

        // No-replay: re-emit the stored decision at its current view.
        if let Some(decision) = self.state.p2_decisions.get(&digest).copied() {
            let reply = self.make_phase2_reply(msg.req_id, &digest, decision);
            self.transport.send(from, Message::Phase2Reply(reply));
            return;
        }

        if self.params.validate_proofs {
            let txn = match self.state.ongoing.get(&digest) {
                Some(txn) => txn.clone(),
                None => match msg.txn {
                    Some(ref txn) => txn.clone(),
                    None => {
                        debug!(digest = %digest, "PHASE2 for unseen txn");
                        self.stats.dropped += 1;
                        return;
                    }
                },
            };
            if self.params.signed_messages {
                let my_vote = self.lookup_p1_vote(&digest);
                if !verify::validate_p1_replies(
                    msg.decision,
                    false,
                    &txn,
                    &digest,
                    &msg.grouped_sigs,
                    &self.cfg,
                    &self.params,
                    self.key_manager.as_ref(),
                    my_vote,
                ) {
                    debug!(digest = %digest, "PHASE2 p1 quorum validation failed");
                    self.stats.dropped += 1;
                    return;
                }
            }
        }

        self.state.p2_decisions.insert(digest.clone(), msg.decision);
        self.state.current_views.insert(digest.clone(), 0);
        self.state.decision_views.insert(digest.clone(), 0);
        self.start_client_timer(&digest);

        let reply = self.make_phase2_reply(msg.req_id, &digest, msg.decision);
        self.transport.send(from, Message::Phase2Reply(reply));
    }

    fn make_phase2_reply(
        &mut self,
        req_id: ReqId,
        digest: &Digest,
        decision: CommitDecision,
    ) -> Phase2Reply {
        let view = *self
            .state
            .decision_views
            .entry(digest.clone())
            .or_insert(0);
        let p2_decision = Phase2Decision {
            decision,
            txn_digest: digest.clone(),
            view,
        };
        let signed_p2_decision = (self.params.validate_proofs && self.params.signed_messages)
            .then(|| self.sign_own(wire::encode_p2_decision(&p2_decision)));
        Phase2Reply {
            req_id,
            p2_decision,
            signed_p2_decision,
        }
    }

    fn lookup_p1_vote(&self, digest: &Digest) -> Option<(ProcessId, CcResult)> {
        self.state
            .p1_decisions
            .get(digest)
            .map(|result| (self.id, *result))
    }

    fn lookup_p2_vote(&self, digest: &Digest) -> Option<(ProcessId, CommitDecision)> {
        self.state
            .p2_decisions
            .get(digest)
            .map(|decision| (self.id, *decision))
    }

    // -----------------------------------------------------------------------
    // Writeback.

    fn handle_writeback(&mut self, _from: Address, msg: Writeback) {
        let digest = msg.txn_digest.clone();
        // Applying a writeback twice is a no-op.
        if self.state.committed.contains_key(&digest) || self.state.aborted.contains(&digest) {
            return;
        }
        let Some(txn) = self.state.ongoing.get(&digest) else {
            debug!(digest = %digest, "WRITEBACK for unseen txn");
            self.stats.dropped += 1;
            return;
        };
        debug!(digest = %digest, decision = ?msg.decision, "WRITEBACK");

        if self.params.validate_proofs {
            if self.params.signed_messages
                && msg.decision == CommitDecision::Commit
                && msg.p1_sigs.is_some()
            {
                let grouped = msg.p1_sigs.as_ref().expect("checked p1 sigs");
                let my_vote = self.lookup_p1_vote(&digest);
                if !verify::validate_p1_replies(
                    CommitDecision::Commit,
                    true,
                    txn,
                    &digest,
                    grouped,
                    &self.cfg,
                    &self.params,
                    self.key_manager.as_ref(),
                    my_vote,
                ) {
                    debug!(digest = %digest, "fast-commit quorum validation failed");
                    self.stats.dropped += 1;
                    return;
                }
            } else if self.params.signed_messages && msg.p2_sigs.is_some() {
                let sigs = msg.p2_sigs.as_ref().expect("checked p2 sigs");
                let Some(log_group) = txn.logging_shard(&digest) else {
                    self.stats.dropped += 1;
                    return;
                };
                let my_vote = self.lookup_p2_vote(&digest);
                if !verify::validate_p2_replies(
                    msg.decision,
                    &digest,
                    sigs,
                    log_group,
                    &self.cfg,
                    &self.params,
                    self.key_manager.as_ref(),
                    my_vote,
                ) {
                    debug!(digest = %digest, "p2 quorum validation failed");
                    self.stats.dropped += 1;
                    return;
                }
            } else if msg.decision == CommitDecision::Abort && msg.conflict.is_some() {
                let conflict = msg.conflict.as_ref().expect("checked conflict");
                if !verify::validate_committed_conflict(
                    conflict,
                    txn,
                    &self.cfg,
                    &self.params,
                    self.key_manager.as_ref(),
                ) {
                    debug!(digest = %digest, "committed conflict validation failed");
                    self.stats.dropped += 1;
                    return;
                }
            } else if self.params.signed_messages {
                debug!(digest = %digest, "WRITEBACK without usable evidence");
                self.stats.dropped += 1;
                return;
            }
        }

        // Cache for fallback forwarding before applying.
        self.state
            .writeback_messages
            .insert(digest.clone(), msg.clone());

        match msg.decision {
            CommitDecision::Commit => {
                let quorum = if let Some(grouped) = msg.p1_sigs {
                    ProofQuorum::Phase1(grouped)
                } else if let Some(sigs) = msg.p2_sigs {
                    ProofQuorum::Phase2(sigs)
                } else {
                    ProofQuorum::Phase1(GroupedSignatures::new())
                };
                self.commit(&digest, quorum);
            }
            CommitDecision::Abort => self.abort_txn(&digest),
        }
    }

    fn commit(&mut self, digest: &Digest, quorum: ProofQuorum) {
        let txn = self
            .state
            .ongoing
            .remove(digest)
            .expect("commit of transaction not in ongoing");
        let ts = txn.timestamp;
        let owns = self.key_filter();
        self.state.clean_prepared(digest, &txn, &owns);

        let proof = Arc::new(CommittedProof { txn, quorum });
        self.state.committed.insert(digest.clone(), proof.clone());

        for read in &proof.txn.read_set {
            if !owns(&read.key) {
                continue;
            }
            self.state.store.commit_get(&read.key, read.version, ts);
            self.state
                .committed_reads
                .entry(read.key.clone())
                .or_default()
                .insert((ts, read.version, digest.clone()));
        }
        for write in &proof.txn.write_set {
            if !owns(&write.key) {
                continue;
            }
            debug!(
                digest = %digest,
                key = %wire::hex_prefix(&write.key, 16),
                "committing write"
            );
            self.state.store.put(
                &write.key,
                Value {
                    data: write.value.clone(),
                    proof: proof.clone(),
                },
                ts,
            );
            self.state.purge_rts(&write.key, ts);
        }

        self.stats.commits += 1;
        self.resolve_dependents(digest);
        self.state.clean_dependencies(digest);
    }

    fn abort_txn(&mut self, digest: &Digest) {
        self.state.aborted.insert(digest.clone());
        if let Some(txn) = self.state.ongoing.remove(digest) {
            let owns = self.key_filter();
            self.state.clean_prepared(digest, &txn, &owns);
        }
        self.stats.aborts += 1;
        self.resolve_dependents(digest);
        self.state.clean_dependencies(digest);
    }

    /// Release waiters of a resolved digest and send their delayed replies.
    fn resolve_dependents(&mut self, resolved: &Digest) {
        for (waiter, req_id, requester) in self.state.take_ready_dependents(resolved) {
            let result = {
                let txn = self
                    .state
                    .ongoing
                    .get(&waiter)
                    .expect("waiting transaction not in ongoing");
                self.check_dependencies(txn)
            };
            // A dependency wait can only end in COMMIT or ABSTAIN; an abort
            // here would mint a decision without a conflict proof.
            assert!(
                result != CcResult::Abort,
                "dependency resolution produced an abort"
            );
            debug!(digest = %waiter, result = ?result, "dependency resolved");
            self.send_phase1_reply(req_id, &waiter, result, None, requester);
        }
    }

    // -----------------------------------------------------------------------
    // Abort.

    fn handle_abort(&mut self, _from: Address, msg: Abort) {
        let intent = if self.params.validate_proofs && self.params.signed_messages {
            let Some(signed) = msg.signed_internal else {
                self.stats.dropped += 1;
                return;
            };
            if !verify::verify_signed(self.key_manager.as_ref(), &signed) {
                self.stats.dropped += 1;
                return;
            }
            let Ok(intent) = wire::decode_abort_intent(&signed.data) else {
                self.stats.dropped += 1;
                return;
            };
            // Only the issuing client may release its own read intents.
            if intent.ts.id != signed.process_id {
                self.stats.dropped += 1;
                return;
            }
            intent
        } else {
            let Some(intent) = msg.internal else {
                self.stats.dropped += 1;
                return;
            };
            intent
        };

        for key in &intent.read_set {
            if let Some(entries) = self.state.rts.get_mut(key) {
                entries.remove(&intent.ts);
                if entries.is_empty() {
                    self.state.rts.remove(key);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fallback.

    fn build_attached_view(&self, digest: &Digest) -> AttachedView {
        let current_view = CurrentView {
            txn_digest: digest.clone(),
            view: *self.state.current_views.get(digest).unwrap_or(&0),
            replica_id: self.id,
        };
        let signed_current_view = self
            .params
            .signed_messages
            .then(|| self.sign_own(wire::encode_current_view(&current_view)));
        AttachedView {
            current_view,
            signed_current_view,
        }
    }

    /// Report whatever progress this replica has for a stuck transaction:
    /// the cached writeback, the Phase-2 and/or Phase-1 decisions, or a
    /// fresh Phase-1 run.
    fn handle_phase1_fb(&mut self, from: Address, msg: Phase1Fb) {
        let digest = wire::transaction_digest(&msg.txn, self.params.hash_digest);
        debug!(
            client = msg.txn.client_id,
            seq = msg.txn.client_seq,
            digest = %digest,
            "PHASE1FB"
        );
        self.state
            .interested_clients
            .entry(digest.clone())
            .or_default()
            .insert(from);

        if let Some(wb) = self.state.writeback_messages.get(&digest).cloned() {
            let reply = Phase1FbReply {
                req_id: msg.req_id,
                txn_digest: digest.clone(),
                wb: Some(wb),
                p1r: None,
                p2r: None,
                attached_view: self.build_attached_view(&digest),
            };
            self.transport.send(from, Message::Phase1FbReply(reply));
            return;
        }

        let p1 = self
            .state
            .p1_decisions
            .get(&digest)
            .copied()
            .filter(|result| *result != CcResult::Wait);
        let p2 = self.state.p2_decisions.get(&digest).copied();

        match (p1, p2) {
            (p1r, Some(decision)) => {
                // Cases 2 and 3: a Phase-2 decision, with the Phase-1 vote
                // attached when one exists.
                let p1r = p1r.map(|result| {
                    let conflict = (result == CcResult::Abort)
                        .then(|| self.state.p1_conflicts.get(&digest).cloned())
                        .flatten();
                    self.make_phase1_reply(msg.req_id, &digest, result, conflict)
                });
                let p2r = self.make_phase2_reply(msg.req_id, &digest, decision);
                let reply = Phase1FbReply {
                    req_id: msg.req_id,
                    txn_digest: digest.clone(),
                    wb: None,
                    p1r,
                    p2r: Some(p2r),
                    attached_view: self.build_attached_view(&digest),
                };
                self.transport.send(from, Message::Phase1FbReply(reply));
            }
            (Some(result), None) => {
                // Case 4: only the Phase-1 decision.
                let conflict = (result == CcResult::Abort)
                    .then(|| self.state.p1_conflicts.get(&digest).cloned())
                    .flatten();
                let p1r = self.make_phase1_reply(msg.req_id, &digest, result, conflict);
                let reply = Phase1FbReply {
                    req_id: msg.req_id,
                    txn_digest: digest.clone(),
                    wb: None,
                    p1r: Some(p1r),
                    p2r: None,
                    attached_view: self.build_attached_view(&digest),
                };
                self.transport.send(from, Message::Phase1FbReply(reply));
            }
            (None, None) => {
                if self.state.p1_decisions.contains_key(&digest) {
                    // Still waiting on dependencies; the reply follows the
                    // original request when they resolve.
                    return;
                }
                if !self.deps_are_witnessed(&msg.txn, &digest) {
                    return;
                }
                self.state.current_views.entry(digest.clone()).or_insert(0);

                let txn = msg.txn;
                let (result, conflict) = self.do_occ_check(msg.req_id, from, &digest, &txn);
                self.state.ongoing.insert(digest.clone(), txn);

                if result == CcResult::Wait {
                    self.state.p1_decisions.insert(digest, CcResult::Wait);
                    return;
                }
                self.record_p1(&digest, result, &conflict);
                self.start_client_timer(&digest);
                let p1r = self.make_phase1_reply(msg.req_id, &digest, result, conflict);
                let reply = Phase1FbReply {
                    req_id: msg.req_id,
                    txn_digest: digest.clone(),
                    wb: None,
                    p1r: Some(p1r),
                    p2r: None,
                    attached_view: self.build_attached_view(&digest),
                };
                self.transport.send(from, Message::Phase1FbReply(reply));
            }
        }
    }

    fn handle_phase2_fb(&mut self, from: Address, msg: Phase2Fb) {
        let digest = msg.txn_digest.clone();
        debug!(digest = %digest, decision = ?msg.decision, "PHASE2FB");
        self.state
            .interested_clients
            .entry(digest.clone())
            .or_default()
            .insert(from);

        if let Some(wb) = self.state.writeback_messages.get(&digest).cloned() {
            let reply = Phase1FbReply {
                req_id: msg.req_id,
                txn_digest: digest.clone(),
                wb: Some(wb),
                p1r: None,
                p2r: None,
                attached_view: self.build_attached_view(&digest),
            };
            self.transport.send(from, Message::Phase1FbReply(reply));
            return;
        }

        if let Some(decision) = self.state.p2_decisions.get(&digest).copied() {
            let p2r = self.make_phase2_reply(msg.req_id, &digest, decision);
            let reply = Phase2FbReply {
                txn_digest: digest.clone(),
                p2r,
                attached_view: self.build_attached_view(&digest),
            };
            self.transport.send(from, Message::Phase2FbReply(reply));
            return;
        }

        // The original client is entitled to its timeout before anyone else
        // may drive the transaction.
        let now = self.clock.now_ms();
        let elapsed = match self.state.client_starttime.get(&digest) {
            Some(start) => now.saturating_sub(*start),
            None => {
                self.state.client_starttime.insert(digest.clone(), now);
                self.transport.timer(
                    self.params.client_timeout_ms,
                    TimerEvent {
                        from,
                        msg: Message::Phase2Fb(msg),
                    },
                );
                return;
            }
        };
        if elapsed < self.params.client_timeout_ms {
            self.transport.timer(
                self.params.client_timeout_ms - elapsed,
                TimerEvent {
                    from,
                    msg: Message::Phase2Fb(msg),
                },
            );
            return;
        }

        self.verify_p2_fb(from, &digest, msg);
    }

    /// Try to install a Phase-2 decision from fallback evidence, then reply.
    /// The requester becomes an interested client: it carried Phase-2
    /// evidence and is owed the final decision.
    fn verify_p2_fb(&mut self, remote: Address, digest: &Digest, p2fb: Phase2Fb) {
        self.state
            .interested_clients
            .entry(digest.clone())
            .or_default()
            .insert(remote);
        let log_group = match self.state.ongoing.get(digest) {
            Some(txn) => txn.logging_shard(digest),
            None => p2fb
                .txn
                .as_ref()
                .and_then(|txn| txn.logging_shard(digest)),
        };
        let Some(log_group) = log_group else {
            debug!(digest = %digest, "PHASE2FB for unseen txn");
            self.stats.dropped += 1;
            return;
        };

        if !p2fb.p2_replies.is_empty() {
            // f+1 distinct logging-shard replicas agreeing on the decision.
            let mut signers: HashSet<ProcessId> = HashSet::new();
            let mut plain = 0usize;
            for reply in &p2fb.p2_replies {
                if self.params.signed_messages {
                    let Some(sm) = &reply.signed_p2_decision else {
                        continue;
                    };
                    if !self.cfg.in_group(sm.process_id, log_group) {
                        continue;
                    }
                    let Ok(p2) = wire::decode_p2_decision(&sm.data) else {
                        continue;
                    };
                    if p2.decision != p2fb.decision || p2.txn_digest != *digest {
                        continue;
                    }
                    if !verify::verify_signed(self.key_manager.as_ref(), sm) {
                        continue;
                    }
                    signers.insert(sm.process_id);
                } else if reply.p2_decision.decision == p2fb.decision
                    && reply.p2_decision.txn_digest == *digest
                {
                    plain += 1;
                }
            }
            let count = if self.params.signed_messages {
                signers.len()
            } else {
                plain
            };
            if count >= self.cfg.p2fb_quorum() {
                self.state.p2_decisions.insert(digest.clone(), p2fb.decision);
                self.state.decision_views.insert(digest.clone(), 0);
            }
        } else if let Some(ref grouped) = p2fb.grouped_sigs {
            // Same predicate as Phase-2 proper.
            let txn = self
                .state
                .ongoing
                .get(digest)
                .cloned()
                .or_else(|| p2fb.txn.clone());
            let Some(txn) = txn else {
                self.stats.dropped += 1;
                return;
            };
            let my_vote = self.lookup_p1_vote(digest);
            if verify::validate_p1_replies(
                p2fb.decision,
                false,
                &txn,
                digest,
                grouped,
                &self.cfg,
                &self.params,
                self.key_manager.as_ref(),
                my_vote,
            ) {
                self.state.p2_decisions.insert(digest.clone(), p2fb.decision);
                self.state.decision_views.insert(digest.clone(), 0);
            }
        }

        let Some(decision) = self.state.p2_decisions.get(digest).copied() else {
            debug!(digest = %digest, "PHASE2FB produced no decision");
            return;
        };
        let p2r = self.make_phase2_reply(p2fb.req_id, digest, decision);
        let reply = Phase2FbReply {
            txn_digest: digest.clone(),
            p2r,
            attached_view: self.build_attached_view(digest),
        };
        self.transport.send(remote, Message::Phase2FbReply(reply));
    }

    fn handle_invoke_fb(&mut self, from: Address, msg: InvokeFb) {
        let digest = msg.txn_digest.clone();
        debug!(digest = %digest, view = msg.proposed_view, "INVOKEFB");
        if msg.proposed_view <= *self.state.current_views.get(&digest).unwrap_or(&0) {
            return;
        }

        let now = self.clock.now_ms();
        let elapsed = match self.state.client_starttime.get(&digest) {
            Some(start) => now.saturating_sub(*start),
            None => {
                // Never seen this transaction; start the clock ourselves.
                self.state.client_starttime.insert(digest.clone(), now);
                self.transport.timer(
                    self.params.client_timeout_ms,
                    TimerEvent {
                        from,
                        msg: Message::InvokeFb(msg),
                    },
                );
                return;
            }
        };
        if elapsed < self.params.client_timeout_ms {
            self.transport.timer(
                self.params.client_timeout_ms - elapsed,
                TimerEvent {
                    from,
                    msg: Message::InvokeFb(msg),
                },
            );
            return;
        }
        // Let the current fallback coordinator's reign play out first.
        if let Some(&window) = self.state.exp_timeouts.get(&digest) {
            let started = *self.state.fb_timeout_start.get(&digest).unwrap_or(&now);
            let fb_elapsed = now.saturating_sub(started);
            if fb_elapsed < window {
                self.transport.timer(
                    window - fb_elapsed,
                    TimerEvent {
                        from,
                        msg: Message::InvokeFb(msg),
                    },
                );
                return;
            }
        }

        let log_group = match self.state.ongoing.get(&digest) {
            Some(txn) => txn.logging_shard(&digest),
            None => msg
                .p2fb
                .as_ref()
                .and_then(|p2fb| p2fb.txn.as_ref())
                .and_then(|txn| txn.logging_shard(&digest)),
        };
        let Some(log_group) = log_group else {
            debug!(digest = %digest, "INVOKEFB for unseen txn");
            self.stats.dropped += 1;
            return;
        };
        if log_group != self.group {
            // Only the logging shard takes part in the election.
            return;
        }

        // A replica without a decision cannot contribute a vote; install one
        // from the inlined Phase-2 fallback evidence first.
        if !self.state.p2_decisions.contains_key(&digest) {
            let Some(p2fb) = msg.p2fb.clone() else {
                return;
            };
            self.verify_p2_fb(from, &digest, p2fb);
            if self.state.writeback_messages.contains_key(&digest)
                || !self.state.p2_decisions.contains_key(&digest)
            {
                return;
            }
        }

        if msg.proposed_view <= *self.state.current_views.get(&digest).unwrap_or(&0) {
            return;
        }
        if !verify::validate_views(
            &msg,
            log_group,
            &self.cfg,
            &self.params,
            self.key_manager.as_ref(),
        ) {
            debug!(digest = %digest, view = msg.proposed_view, "invalid view signatures");
            self.stats.dropped += 1;
            return;
        }

        self.state
            .current_views
            .insert(digest.clone(), msg.proposed_view);
        let coordinator =
            ((msg.proposed_view + digest.first_byte() as u64) % self.cfg.n as u64) as usize;
        let decision = self
            .state
            .p2_decisions
            .get(&digest)
            .copied()
            .expect("decision installed above");
        let elect = ElectMessage {
            req_id: msg.req_id,
            txn_digest: digest.clone(),
            decision,
            view: msg.proposed_view,
        };
        let signed_elect = self.sign_own(wire::encode_elect_message(&elect));
        debug!(
            digest = %digest,
            view = msg.proposed_view,
            coordinator,
            "adopting view, sending elect vote"
        );
        self.transport
            .send_replica(self.group, coordinator, Message::ElectFb(ElectFb { signed_elect }));
        self.stats.fb_elect_votes += 1;

        // First invoke starts the window at the client timeout; every later
        // one doubles it.
        let now = self.clock.now_ms();
        self.state
            .exp_timeouts
            .entry(digest.clone())
            .and_modify(|window| *window *= 2)
            .or_insert(self.params.client_timeout_ms);
        self.state.fb_timeout_start.insert(digest, now);
    }

    /// Coordinator side: collect elect votes until n-f, then decide and
    /// broadcast.
    fn handle_elect_fb(&mut self, _from: Address, msg: ElectFb) {
        let sm = msg.signed_elect;
        let Ok(elect) = wire::decode_elect_message(&sm.data) else {
            self.stats.dropped += 1;
            return;
        };
        let digest = elect.txn_digest.clone();
        if self.idx as u64 != (elect.view + digest.first_byte() as u64) % self.cfg.n as u64 {
            // Not the coordinator for this view.
            return;
        }
        if !self.cfg.in_group(sm.process_id, self.group) {
            return;
        }
        if self.params.signed_messages && !verify::verify_signed(self.key_manager.as_ref(), &sm) {
            self.stats.dropped += 1;
            return;
        }

        let tally = self.state.elect_tallies.entry(digest.clone()).or_default();
        if tally.view > elect.view {
            return;
        }
        if tally.view < elect.view {
            tally.view = elect.view;
            tally.commit_votes = 0;
            tally.signers.clear();
            tally.sigs.clear();
        }
        if !tally.signers.insert(sm.process_id) {
            return;
        }
        if elect.decision == CommitDecision::Commit {
            tally.commit_votes += 1;
        }
        tally.sigs.push(sm);

        if tally.sigs.len() == self.cfg.elect_quorum() {
            let decision = if tally.commit_votes >= self.cfg.elect_commit_votes() {
                CommitDecision::Commit
            } else {
                CommitDecision::Abort
            };
            let decision_fb = DecisionFb {
                req_id: elect.req_id,
                txn_digest: digest.clone(),
                decision,
                view: elect.view,
                elect_sigs: tally.sigs.clone(),
            };
            debug!(digest = %digest, view = elect.view, decision = ?decision, "broadcasting fallback decision");
            self.transport
                .send_group(self.group, Message::DecisionFb(decision_fb));
            self.stats.fb_decisions_formed += 1;
        }
    }

    /// Replica side: adopt a coordinator decision and distribute it to every
    /// interested client.
    fn handle_decision_fb(&mut self, _from: Address, msg: DecisionFb) {
        let digest = msg.txn_digest.clone();
        if msg.view < *self.state.decision_views.get(&digest).unwrap_or(&0) {
            return;
        }
        let count = verify::count_elect_sigs(
            &msg.elect_sigs,
            msg.decision,
            msg.view,
            &digest,
            self.group,
            &self.cfg,
            &self.params,
            self.key_manager.as_ref(),
        );
        if count < self.cfg.decision_sigs() {
            debug!(digest = %digest, count, "DECISIONFB with insufficient elect sigs");
            self.stats.dropped += 1;
            return;
        }

        if msg.view > *self.state.decision_views.get(&digest).unwrap_or(&0)
            || !self.state.decision_views.contains_key(&digest)
        {
            self.state.decision_views.insert(digest.clone(), msg.view);
            self.state.p2_decisions.insert(digest.clone(), msg.decision);
            // Fallback decisions never decrease decision views, and a
            // decision at view v implies the replica has seen view v.
            let current = self.state.current_views.entry(digest.clone()).or_insert(0);
            if *current < msg.view {
                *current = msg.view;
            }
            self.stats.fb_decisions_adopted += 1;
        }

        let Some(decision) = self.state.p2_decisions.get(&digest).copied() else {
            return;
        };
        let p2r = self.make_phase2_reply(msg.req_id, &digest, decision);
        let attached_view = self.build_attached_view(&digest);
        let targets: Vec<Address> = self
            .state
            .interested_clients
            .get(&digest)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default();
        for target in targets {
            self.transport.send(
                target,
                Message::Phase2FbReply(Phase2FbReply {
                    txn_digest: digest.clone(),
                    p2r: p2r.clone(),
                    attached_view: attached_view.clone(),
                }),
            );
        }
    }

    fn sign_own(&self, data: Vec<u8>) -> SignedMessage {
        let signature = if self.params.signed_messages {
            self.key_manager
                .sign(self.id, &data)
                .expect("own signing key")
        } else {
            Vec::new()
        };
        SignedMessage {
            process_id: self.id,
            data,
            signature,
        }
    }
}
