//! In-memory state and indexes for a single replica.
//!
//! This module holds every mutable map the protocol handlers touch, separate
//! from the protocol logic so the index operations stay testable. All indexes
//! are keyed by digest: `ongoing` is the arena for in-flight transactions and
//! `committed` owns proofs; the secondary indexes resolve through them on
//! demand, which keeps `clean` trivial and avoids aliasing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::store::VersionedStore;
use super::types::{
    Address, CcResult, CommitDecision, CommittedProof, Digest, ProcessId, ReqId, SignedMessage,
    Timestamp, Transaction, Writeback,
};

/// A transaction blocked on unresolved dependencies, plus where the eventual
/// Phase-1 reply must go.
#[derive(Debug)]
pub(super) struct WaitingDependency {
    pub(super) req_id: ReqId,
    pub(super) requester: Address,
    pub(super) deps: HashSet<Digest>,
}

/// Elect votes collected by the fallback coordinator for one digest.
#[derive(Debug, Default)]
pub(super) struct ElectTally {
    pub(super) view: u64,
    pub(super) commit_votes: usize,
    pub(super) signers: HashSet<ProcessId>,
    pub(super) sigs: Vec<SignedMessage>,
}

/// Mutable replica state. Owned exclusively by the replica; handlers run to
/// completion on a single loop, so there is no interior mutability.
pub(super) struct ReplicaState {
    pub(super) store: VersionedStore,
    /// Arena of in-flight transactions, keyed by digest.
    pub(super) ongoing: HashMap<Digest, Transaction>,
    /// Prepared transactions and the timestamp they prepared at.
    pub(super) prepared: HashMap<Digest, Timestamp>,
    /// Key -> digests of prepared transactions reading it.
    pub(super) prepared_reads: HashMap<Vec<u8>, HashSet<Digest>>,
    /// Key -> prepared writers ordered by timestamp.
    pub(super) prepared_writes: HashMap<Vec<u8>, BTreeMap<Timestamp, Digest>>,
    /// Key -> (commit ts, read version, digest) of committed readers.
    pub(super) committed_reads: HashMap<Vec<u8>, BTreeSet<(Timestamp, Timestamp, Digest)>>,
    /// Key -> reader timestamps seen but not yet subsumed by a commit.
    pub(super) rts: HashMap<Vec<u8>, BTreeSet<Timestamp>>,
    pub(super) committed: HashMap<Digest, Arc<CommittedProof>>,
    pub(super) aborted: HashSet<Digest>,
    pub(super) p1_decisions: HashMap<Digest, CcResult>,
    pub(super) p1_conflicts: HashMap<Digest, CommittedProof>,
    pub(super) p2_decisions: HashMap<Digest, CommitDecision>,
    pub(super) current_views: HashMap<Digest, u64>,
    pub(super) decision_views: HashMap<Digest, u64>,
    /// Validated writebacks cached for fallback forwarding.
    pub(super) writeback_messages: HashMap<Digest, Writeback>,
    pub(super) interested_clients: HashMap<Digest, HashSet<Address>>,
    /// Milliseconds; gates the fallback against a live original client.
    pub(super) client_starttime: HashMap<Digest, u64>,
    pub(super) fb_timeout_start: HashMap<Digest, u64>,
    pub(super) exp_timeouts: HashMap<Digest, u64>,
    /// Digest D -> transactions waiting on D.
    pub(super) dependents: HashMap<Digest, HashSet<Digest>>,
    pub(super) waiting_deps: HashMap<Digest, WaitingDependency>,
    pub(super) elect_tallies: HashMap<Digest, ElectTally>,
}

impl ReplicaState {
    pub(super) fn new() -> Self {
        Self {
            store: VersionedStore::new(),
            ongoing: HashMap::new(),
            prepared: HashMap::new(),
            prepared_reads: HashMap::new(),
            prepared_writes: HashMap::new(),
            committed_reads: HashMap::new(),
            rts: HashMap::new(),
            committed: HashMap::new(),
            aborted: HashSet::new(),
            p1_decisions: HashMap::new(),
            p1_conflicts: HashMap::new(),
            p2_decisions: HashMap::new(),
            current_views: HashMap::new(),
            decision_views: HashMap::new(),
            writeback_messages: HashMap::new(),
            interested_clients: HashMap::new(),
            client_starttime: HashMap::new(),
            fb_timeout_start: HashMap::new(),
            exp_timeouts: HashMap::new(),
            dependents: HashMap::new(),
            waiting_deps: HashMap::new(),
            elect_tallies: HashMap::new(),
        }
    }

    /// Record a transaction in the prepared indexes for every owned key.
    pub(super) fn prepare(
        &mut self,
        digest: &Digest,
        ts: Timestamp,
        txn: &Transaction,
        owns: &dyn Fn(&[u8]) -> bool,
    ) {
        self.prepared.insert(digest.clone(), ts);
        for read in &txn.read_set {
            if owns(&read.key) {
                self.prepared_reads
                    .entry(read.key.clone())
                    .or_default()
                    .insert(digest.clone());
            }
        }
        for write in &txn.write_set {
            if owns(&write.key) {
                self.prepared_writes
                    .entry(write.key.clone())
                    .or_default()
                    .insert(ts, digest.clone());
            }
        }
    }

    /// Remove a transaction from the prepared indexes. Entries for keys the
    /// transaction never prepared under are left untouched.
    pub(super) fn clean_prepared(
        &mut self,
        digest: &Digest,
        txn: &Transaction,
        owns: &dyn Fn(&[u8]) -> bool,
    ) {
        let Some(ts) = self.prepared.remove(digest) else {
            return;
        };
        for read in &txn.read_set {
            if !owns(&read.key) {
                continue;
            }
            if let Some(readers) = self.prepared_reads.get_mut(&read.key) {
                readers.remove(digest);
                if readers.is_empty() {
                    self.prepared_reads.remove(&read.key);
                }
            }
        }
        for write in &txn.write_set {
            if !owns(&write.key) {
                continue;
            }
            if let Some(writers) = self.prepared_writes.get_mut(&write.key) {
                writers.remove(&ts);
                if writers.is_empty() {
                    self.prepared_writes.remove(&write.key);
                }
            }
        }
    }

    /// Drop every read-timestamp entry at or below `ts` for `key`.
    pub(super) fn purge_rts(&mut self, key: &[u8], ts: Timestamp) {
        let Some(entries) = self.rts.get_mut(key) else {
            return;
        };
        entries.retain(|entry| *entry > ts);
        if entries.is_empty() {
            self.rts.remove(key);
        }
    }

    /// Register that `digest` waits on `dep`.
    pub(super) fn add_waiting(
        &mut self,
        digest: &Digest,
        dep: &Digest,
        req_id: ReqId,
        requester: Address,
    ) {
        self.dependents
            .entry(dep.clone())
            .or_default()
            .insert(digest.clone());
        let waiting = self
            .waiting_deps
            .entry(digest.clone())
            .or_insert_with(|| WaitingDependency {
                req_id,
                requester,
                deps: HashSet::new(),
            });
        waiting.req_id = req_id;
        waiting.requester = requester;
        waiting.deps.insert(dep.clone());
    }

    /// Resolve `resolved` out of every waiter and return those whose
    /// dependency sets are now empty, with their pending reply routes.
    pub(super) fn take_ready_dependents(
        &mut self,
        resolved: &Digest,
    ) -> Vec<(Digest, ReqId, Address)> {
        let Some(waiters) = self.dependents.remove(resolved) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for waiter in waiters {
            let entry = self
                .waiting_deps
                .get_mut(&waiter)
                .expect("dependent without waiting record");
            entry.deps.remove(resolved);
            if entry.deps.is_empty() {
                let entry = self
                    .waiting_deps
                    .remove(&waiter)
                    .expect("waiting record vanished");
                ready.push((waiter, entry.req_id, entry.requester));
            }
        }
        ready
    }

    /// Unlink a finished transaction from the dependency graph entirely.
    pub(super) fn clean_dependencies(&mut self, digest: &Digest) {
        if let Some(waiting) = self.waiting_deps.remove(digest) {
            for dep in waiting.deps {
                if let Some(dependents) = self.dependents.get_mut(&dep) {
                    dependents.remove(digest);
                    if dependents.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
        self.dependents.remove(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{ReadOp, WriteOp};
    use super::*;

    fn digest(tag: u8) -> Digest {
        Digest(vec![tag; 32])
    }

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn txn(reads: &[&[u8]], writes: &[&[u8]], ts: Timestamp) -> Transaction {
        Transaction {
            client_id: ts.id,
            client_seq: 1,
            timestamp: ts,
            read_set: reads
                .iter()
                .map(|key| ReadOp {
                    key: key.to_vec(),
                    version: Timestamp::zero(),
                })
                .collect(),
            write_set: writes
                .iter()
                .map(|key| WriteOp {
                    key: key.to_vec(),
                    value: b"v".to_vec(),
                })
                .collect(),
            deps: Vec::new(),
            involved_groups: vec![0],
        }
    }

    #[test]
    fn prepare_and_clean_are_symmetric() {
        let mut state = ReplicaState::new();
        let owns = |_: &[u8]| true;
        let ts = Timestamp::new(10, 1);
        let d = digest(1);
        let t = txn(&[b"r"], &[b"w"], ts);

        state.prepare(&d, ts, &t, &owns);
        assert_eq!(state.prepared.get(&d), Some(&ts));
        assert!(state.prepared_reads[b"r".as_slice()].contains(&d));
        assert_eq!(state.prepared_writes[b"w".as_slice()].get(&ts), Some(&d));

        state.clean_prepared(&d, &t, &owns);
        assert!(state.prepared.is_empty());
        assert!(state.prepared_reads.is_empty());
        assert!(state.prepared_writes.is_empty());

        // A second clean is a no-op.
        state.clean_prepared(&d, &t, &owns);
    }

    #[test]
    fn prepare_skips_unowned_keys() {
        let mut state = ReplicaState::new();
        let owns = |key: &[u8]| key == b"mine";
        let ts = Timestamp::new(10, 1);
        let d = digest(2);
        let t = txn(&[b"other"], &[b"mine", b"other"], ts);

        state.prepare(&d, ts, &t, &owns);
        assert!(state.prepared_reads.is_empty());
        assert_eq!(state.prepared_writes.len(), 1);
        assert!(state.prepared_writes.contains_key(b"mine".as_slice()));
    }

    #[test]
    fn rts_purge_removes_at_or_below_only() {
        let mut state = ReplicaState::new();
        for time in [10, 20, 30] {
            state
                .rts
                .entry(b"k".to_vec())
                .or_default()
                .insert(Timestamp::new(time, 1));
        }

        state.purge_rts(b"k", Timestamp::new(20, 1));
        let left: Vec<Timestamp> = state.rts[b"k".as_slice()].iter().copied().collect();
        assert_eq!(left, vec![Timestamp::new(30, 1)]);

        state.purge_rts(b"k", Timestamp::new(99, 9));
        assert!(state.rts.is_empty());
    }

    #[test]
    fn dependents_release_when_last_dep_resolves() {
        let mut state = ReplicaState::new();
        let waiter = digest(1);
        let dep_a = digest(2);
        let dep_b = digest(3);
        let requester = addr(9000);

        state.add_waiting(&waiter, &dep_a, 7, requester);
        state.add_waiting(&waiter, &dep_b, 7, requester);

        assert!(state.take_ready_dependents(&dep_a).is_empty());
        let ready = state.take_ready_dependents(&dep_b);
        assert_eq!(ready, vec![(waiter.clone(), 7, requester)]);
        assert!(state.waiting_deps.is_empty());
        assert!(state.dependents.is_empty());
    }

    #[test]
    fn clean_dependencies_unlinks_both_directions() {
        let mut state = ReplicaState::new();
        let waiter = digest(1);
        let dep = digest(2);
        state.add_waiting(&waiter, &dep, 1, addr(9001));

        state.clean_dependencies(&waiter);
        assert!(state.waiting_deps.is_empty());
        assert!(state.dependents.is_empty());
    }
}
