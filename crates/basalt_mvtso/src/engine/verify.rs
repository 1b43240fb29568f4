//! Signature-quorum validation.
//!
//! Every validator here parses the canonical bytes inside each signature
//! envelope and compares the semantic fields, rather than comparing raw
//! bytes: envelopes from different replicas legitimately differ (views,
//! committed piggybacks) while still witnessing the same fact. Counting is
//! always over distinct signer ids. Invalid entries are skipped, never
//! fatal: a quorum either accumulates or it does not.

use std::collections::HashSet;

use tracing::debug;

use super::types::{
    CcResult, CommitDecision, CommittedProof, Dependency, Digest, GroupConfig, GroupId,
    GroupedSignatures, InvokeFb, KeyManager, Params, ProcessId, ProofQuorum, SignedMessage,
    Transaction,
};
use super::wire;

/// Verify one signature envelope against its claimed signer.
pub fn verify_signed(km: &dyn KeyManager, sm: &SignedMessage) -> bool {
    km.verify(sm.process_id, &sm.data, &sm.signature)
}

/// Count distinct replicas of `group` whose envelopes carry a valid
/// concurrency-control vote of `expected` for `digest`.
///
/// `my_vote` short-circuits this replica's own entry: a vote it genuinely
/// cast is accepted by comparison, and an envelope that misreports its vote
/// never counts.
fn count_cc_votes(
    sigs: &[SignedMessage],
    group: GroupId,
    digest: &Digest,
    expected: CcResult,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
    my_vote: Option<(ProcessId, CcResult)>,
) -> usize {
    let mut signers: HashSet<ProcessId> = HashSet::new();
    for sm in sigs {
        if !cfg.in_group(sm.process_id, group) {
            continue;
        }
        let Ok((result, vote_digest)) = wire::decode_cc_vote(&sm.data) else {
            continue;
        };
        if result != expected || vote_digest != *digest {
            continue;
        }
        match my_vote {
            Some((my_id, my_result)) if sm.process_id == my_id => {
                if my_result != expected {
                    continue;
                }
            }
            _ => {
                if params.signed_messages && !verify_signed(km, sm) {
                    continue;
                }
            }
        }
        signers.insert(sm.process_id);
    }
    signers.len()
}

/// Validate grouped Phase-1 reply signatures against a proposed decision.
///
/// COMMIT requires a commit quorum (fast or slow) from *every* involved
/// group; ABORT requires abstain evidence from at least one group.
pub fn validate_p1_replies(
    decision: CommitDecision,
    fast: bool,
    txn: &Transaction,
    digest: &Digest,
    grouped: &GroupedSignatures,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
    my_vote: Option<(ProcessId, CcResult)>,
) -> bool {
    match decision {
        CommitDecision::Commit => {
            let required = if fast {
                cfg.fast_quorum()
            } else {
                cfg.slow_quorum()
            };
            for group in &txn.involved_groups {
                let Some(sigs) = grouped.get(group) else {
                    debug!(group, "p1 quorum missing group");
                    return false;
                };
                let count = count_cc_votes(
                    sigs,
                    *group,
                    digest,
                    CcResult::Commit,
                    cfg,
                    params,
                    km,
                    my_vote,
                );
                if count < required {
                    debug!(group, count, required, "p1 commit quorum short");
                    return false;
                }
            }
            true
        }
        CommitDecision::Abort => {
            let required = cfg.abort_quorum();
            for group in &txn.involved_groups {
                let Some(sigs) = grouped.get(group) else {
                    continue;
                };
                let count = count_cc_votes(
                    sigs,
                    *group,
                    digest,
                    CcResult::Abstain,
                    cfg,
                    params,
                    km,
                    my_vote,
                );
                if count >= required {
                    return true;
                }
            }
            debug!("no group produced abort evidence");
            false
        }
    }
}

/// Validate Phase-2 reply signatures from the logging shard: a p2 quorum of
/// distinct signers agreeing on (decision, digest) at one view.
pub fn validate_p2_replies(
    decision: CommitDecision,
    digest: &Digest,
    sigs: &[SignedMessage],
    log_group: GroupId,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
    my_vote: Option<(ProcessId, CommitDecision)>,
) -> bool {
    let mut signers: HashSet<ProcessId> = HashSet::new();
    let mut quorum_view: Option<u64> = None;
    for sm in sigs {
        if !cfg.in_group(sm.process_id, log_group) {
            continue;
        }
        let Ok(p2) = wire::decode_p2_decision(&sm.data) else {
            continue;
        };
        if p2.decision != decision || p2.txn_digest != *digest {
            continue;
        }
        match quorum_view {
            None => quorum_view = Some(p2.view),
            Some(view) if view != p2.view => continue,
            Some(_) => {}
        }
        match my_vote {
            Some((my_id, my_decision)) if sm.process_id == my_id => {
                if my_decision != decision {
                    continue;
                }
            }
            _ => {
                if params.signed_messages && !verify_signed(km, sm) {
                    continue;
                }
            }
        }
        signers.insert(sm.process_id);
    }
    let ok = signers.len() >= cfg.p2_quorum();
    if !ok {
        debug!(
            count = signers.len(),
            required = cfg.p2_quorum(),
            "p2 quorum short"
        );
    }
    ok
}

/// Validate a committed proof: genesis for seeded data, or a fast Phase-1 /
/// slow Phase-2 commit quorum over the embedded transaction.
pub fn validate_proof(
    proof: &CommittedProof,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
) -> bool {
    if !params.validate_proofs {
        return true;
    }
    let digest = wire::transaction_digest(&proof.txn, params.hash_digest);
    match &proof.quorum {
        ProofQuorum::Genesis => proof.txn == Transaction::default(),
        ProofQuorum::Phase1(grouped) => validate_p1_replies(
            CommitDecision::Commit,
            true,
            &proof.txn,
            &digest,
            grouped,
            cfg,
            params,
            km,
            None,
        ),
        ProofQuorum::Phase2(sigs) => {
            let Some(log_group) = proof.txn.logging_shard(&digest) else {
                return false;
            };
            validate_p2_replies(
                CommitDecision::Commit,
                &digest,
                sigs,
                log_group,
                cfg,
                params,
                km,
                None,
            )
        }
    }
}

/// Whether committed transaction `a` conflicts with `b`. Either `a` wrote a
/// key `b` read, with the write landing between `b`'s read version and `b`'s
/// timestamp, or `a` read a key `b` wrote, with `b`'s write falling inside
/// `a`'s read window.
pub fn transactions_conflict(a: &Transaction, b: &Transaction) -> bool {
    for write in &a.write_set {
        for read in &b.read_set {
            if write.key == read.key
                && read.version < a.timestamp
                && a.timestamp < b.timestamp
            {
                return true;
            }
        }
    }
    for read in &a.read_set {
        for write in &b.write_set {
            if read.key == write.key
                && read.version < b.timestamp
                && b.timestamp < a.timestamp
            {
                return true;
            }
        }
    }
    false
}

/// Validate a fast-abort witness: the conflicting transaction's commit proof
/// must validate and the conflict must be real.
pub fn validate_committed_conflict(
    conflict: &CommittedProof,
    txn: &Transaction,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
) -> bool {
    validate_proof(conflict, cfg, params, km) && transactions_conflict(&conflict.txn, txn)
}

/// Validate a dependency witness: at least `read_dep_size` distinct replicas
/// of the dependency's group signed a read reply exposing exactly this
/// prepared write.
pub fn validate_dependency(
    dep: &Dependency,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
) -> bool {
    let mut signers: HashSet<ProcessId> = HashSet::new();
    for sm in &dep.write_sigs {
        if !cfg.in_group(sm.process_id, dep.involved_group) {
            continue;
        }
        let Ok((key, write)) = wire::decode_visible_write(&sm.data) else {
            continue;
        };
        let Some(prepared) = write.prepared else {
            continue;
        };
        if key != dep.write.key
            || prepared.value != dep.write.value
            || prepared.timestamp != dep.write.timestamp
            || prepared.txn_digest != dep.write.txn_digest
        {
            continue;
        }
        if params.signed_messages && !verify_signed(km, sm) {
            continue;
        }
        signers.insert(sm.process_id);
    }
    signers.len() >= params.read_dep_size
}

/// Validate the signed current views attached to an InvokeFb. Catchup mode
/// needs f+1 views at the proposed view or higher; a regular view change
/// needs 3f+1 views no older than the view below the proposal. Every view
/// must name the same digest and come from the logging shard.
pub(super) fn validate_views(
    invoke: &InvokeFb,
    log_group: GroupId,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
) -> bool {
    let (required, min_view) = if invoke.catchup {
        (cfg.view_catchup_sigs(), invoke.proposed_view)
    } else {
        (cfg.view_change_sigs(), invoke.proposed_view.saturating_sub(1))
    };
    let mut signers: HashSet<ProcessId> = HashSet::new();
    for sm in &invoke.view_sigs {
        if !cfg.in_group(sm.process_id, log_group) {
            continue;
        }
        let Ok(view) = wire::decode_current_view(&sm.data) else {
            continue;
        };
        if view.txn_digest != invoke.txn_digest
            || view.view < min_view
            || view.replica_id != sm.process_id
        {
            continue;
        }
        if params.signed_messages && !verify_signed(km, sm) {
            continue;
        }
        signers.insert(sm.process_id);
    }
    signers.len() >= required
}

/// Count distinct, valid elect votes matching (decision, view, digest).
pub(super) fn count_elect_sigs(
    sigs: &[SignedMessage],
    decision: CommitDecision,
    view: u64,
    digest: &Digest,
    group: GroupId,
    cfg: &GroupConfig,
    params: &Params,
    km: &dyn KeyManager,
) -> usize {
    let mut signers: HashSet<ProcessId> = HashSet::new();
    for sm in sigs {
        if !cfg.in_group(sm.process_id, group) {
            continue;
        }
        let Ok(elect) = wire::decode_elect_message(&sm.data) else {
            continue;
        };
        if elect.decision != decision || elect.view != view || elect.txn_digest != *digest {
            continue;
        }
        if params.signed_messages && !verify_signed(km, sm) {
            continue;
        }
        signers.insert(sm.process_id);
    }
    signers.len()
}

#[cfg(test)]
mod tests {
    use super::super::types::{
        PreparedValue, PreparedWrite, ReadOp, SeedKeyManager, Timestamp, VisibleWrite, WriteOp,
    };
    use super::*;

    fn cfg() -> GroupConfig {
        GroupConfig {
            n: 5,
            f: 1,
            num_groups: 2,
        }
    }

    fn params() -> Params {
        Params::default()
    }

    fn km() -> SeedKeyManager {
        SeedKeyManager::new(16, b"verify-tests")
    }

    fn signed(km: &SeedKeyManager, id: ProcessId, data: Vec<u8>) -> SignedMessage {
        let signature = km.sign(id, &data).unwrap();
        SignedMessage {
            process_id: id,
            data,
            signature,
        }
    }

    fn commit_votes(km: &SeedKeyManager, ids: &[ProcessId], digest: &Digest) -> Vec<SignedMessage> {
        ids.iter()
            .map(|id| signed(km, *id, wire::encode_cc_vote(CcResult::Commit, digest)))
            .collect()
    }

    fn one_group_txn() -> Transaction {
        Transaction {
            client_id: 9,
            client_seq: 1,
            timestamp: Timestamp::new(50, 9),
            read_set: vec![ReadOp {
                key: b"k".to_vec(),
                version: Timestamp::new(10, 1),
            }],
            write_set: Vec::new(),
            deps: Vec::new(),
            involved_groups: vec![0],
        }
    }

    #[test]
    fn fast_commit_quorum_needs_every_group() {
        let cfg = cfg();
        let params = params();
        let km = km();
        let mut txn = one_group_txn();
        txn.involved_groups = vec![0, 1];
        let digest = wire::transaction_digest(&txn, false);

        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, commit_votes(&km, &[0, 1, 2, 3, 4], &digest));
        assert!(!validate_p1_replies(
            CommitDecision::Commit,
            true,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));

        grouped.insert(1, commit_votes(&km, &[5, 6, 7, 8, 9], &digest));
        assert!(validate_p1_replies(
            CommitDecision::Commit,
            true,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));
    }

    #[test]
    fn duplicate_signers_count_once() {
        let cfg = cfg();
        let params = params();
        let km = km();
        let txn = one_group_txn();
        let digest = wire::transaction_digest(&txn, false);

        // Three distinct signers plus a duplicate: still short of 3f+1 = 4.
        let mut sigs = commit_votes(&km, &[0, 1, 2], &digest);
        sigs.push(sigs[2].clone());
        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, sigs);
        assert!(!validate_p1_replies(
            CommitDecision::Commit,
            false,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));

        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, commit_votes(&km, &[0, 1, 2, 3], &digest));
        assert!(validate_p1_replies(
            CommitDecision::Commit,
            false,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));
    }

    #[test]
    fn abort_evidence_is_abstains_from_one_group() {
        let cfg = cfg();
        let params = params();
        let km = km();
        let txn = one_group_txn();
        let digest = wire::transaction_digest(&txn, false);

        let abstains: Vec<SignedMessage> = [0u64, 1]
            .iter()
            .map(|id| signed(&km, *id, wire::encode_cc_vote(CcResult::Abstain, &digest)))
            .collect();
        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, abstains);
        assert!(validate_p1_replies(
            CommitDecision::Abort,
            false,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));

        // Commit votes are not abort evidence.
        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, commit_votes(&km, &[0, 1, 2, 3, 4], &digest));
        assert!(!validate_p1_replies(
            CommitDecision::Abort,
            false,
            &txn,
            &digest,
            &grouped,
            &cfg,
            &params,
            &km,
            None
        ));
    }

    #[test]
    fn p2_quorum_requires_consistent_view_and_distinct_signers() {
        let cfg = cfg();
        let params = params();
        let km = km();
        let digest = Digest(vec![3; 32]);

        let vote = |id: ProcessId, view: u64| {
            signed(
                &km,
                id,
                wire::encode_p2_decision(&super::super::types::Phase2Decision {
                    decision: CommitDecision::Commit,
                    txn_digest: digest.clone(),
                    view,
                }),
            )
        };

        // 4f+1 = 5 distinct signers at view 0.
        let sigs: Vec<SignedMessage> = (0..5).map(|id| vote(id, 0)).collect();
        assert!(validate_p2_replies(
            CommitDecision::Commit,
            &digest,
            &sigs,
            0,
            &cfg,
            &params,
            &km,
            None
        ));

        // A straggler at another view does not count toward the quorum.
        let mut mixed: Vec<SignedMessage> = (0..4).map(|id| vote(id, 0)).collect();
        mixed.push(vote(4, 1));
        assert!(!validate_p2_replies(
            CommitDecision::Commit,
            &digest,
            &mixed,
            0,
            &cfg,
            &params,
            &km,
            None
        ));
    }

    #[test]
    fn dependency_witness_must_match_the_prepared_write() {
        let cfg = cfg();
        let mut params = params();
        params.read_dep_size = 2;
        let km = km();

        let write = PreparedWrite {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            timestamp: Timestamp::new(7, 2),
            txn_digest: Digest(vec![9; 32]),
        };
        let witness = |id: ProcessId, value: &[u8]| {
            let vw = VisibleWrite {
                committed: None,
                prepared: Some(PreparedValue {
                    value: value.to_vec(),
                    timestamp: write.timestamp,
                    txn_digest: write.txn_digest.clone(),
                }),
            };
            signed(&km, id, wire::encode_visible_write(&write.key, &vw))
        };

        let mut dep = Dependency {
            involved_group: 0,
            write: write.clone(),
            write_sigs: vec![witness(0, b"v"), witness(1, b"v")],
        };
        assert!(validate_dependency(&dep, &cfg, &params, &km));

        // A witness for a different value does not count.
        dep.write_sigs = vec![witness(0, b"v"), witness(1, b"other")];
        assert!(!validate_dependency(&dep, &cfg, &params, &km));
    }

    #[test]
    fn conflict_requires_write_between_read_version_and_timestamp() {
        let committed = Transaction {
            client_id: 1,
            client_seq: 1,
            timestamp: Timestamp::new(20, 1),
            read_set: Vec::new(),
            write_set: vec![WriteOp {
                key: b"y".to_vec(),
                value: b"v1".to_vec(),
            }],
            deps: Vec::new(),
            involved_groups: vec![0],
        };
        let mut reader = Transaction {
            client_id: 2,
            client_seq: 1,
            timestamp: Timestamp::new(30, 2),
            read_set: vec![ReadOp {
                key: b"y".to_vec(),
                version: Timestamp::new(5, 0),
            }],
            write_set: Vec::new(),
            deps: Vec::new(),
            involved_groups: vec![0],
        };
        assert!(transactions_conflict(&committed, &reader));

        // Reading the committed version itself is not a conflict.
        reader.read_set[0].version = Timestamp::new(20, 1);
        assert!(!transactions_conflict(&committed, &reader));
    }
}
