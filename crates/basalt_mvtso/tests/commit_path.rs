//! Fast-path commit and the protocol's idempotence laws.

mod common;

use basalt_mvtso::engine::{
    CcResult, CommitDecision, Message, Params, Phase1, Phase2, ProofQuorum, Read, Timestamp,
    Writeback,
};
use common::{client_addr, direct_messages, write_txn, Cluster};

const CLIENT: u64 = 7;

/// Scenario: T1 writes x = "1" at (10, 1) on n=5, f=1. All five replicas
/// vote COMMIT, the client writes back with the fast Phase-1 quorum, and
/// every replica ends up serving the committed value with its proof.
#[test]
fn fast_path_commit_applies_on_every_replica() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client = client_addr(4000);
    let txn = write_txn(CLIENT, 1, Timestamp::new(10, CLIENT), b"x", b"1");

    let digest = cluster.commit_fast(&txn, 1, client);

    for idx in 0..5 {
        cluster.replicas[idx].receive(
            client,
            Message::Read(Read {
                req_id: 50 + idx as u64,
                key: b"x".to_vec(),
                timestamp: Timestamp::new(90, CLIENT),
            }),
        );
        let outbound = cluster.drain(idx);
        let replies = direct_messages(&outbound);
        let Some((_, Message::ReadReply(reply))) = replies.first() else {
            panic!("expected a read reply from replica {idx}");
        };
        let committed = reply.write.committed.as_ref().expect("committed value");
        assert_eq!(committed.value, b"1");
        assert_eq!(committed.timestamp, Timestamp::new(10, CLIENT));

        let proof = reply.proof.as_ref().expect("committed proof");
        assert_eq!(cluster.digest(&proof.txn), digest);
        assert!(matches!(proof.quorum, ProofQuorum::Phase1(_)));
        assert!(reply.signed_write.is_some());
    }
}

#[test]
fn phase1_replay_returns_the_stored_decision() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client = client_addr(4001);
    let txn = write_txn(CLIENT, 1, Timestamp::new(10, CLIENT), b"x", b"1");

    let first = cluster.phase1_all(&txn, 1, client);
    let second = cluster.phase1_all(&txn, 1, client);
    assert_eq!(first, second);

    // A different interested client gets the same decision too.
    let other = client_addr(4002);
    let third = cluster.phase1_all(&txn, 1, other);
    assert_eq!(first, third);
}

#[test]
fn phase2_replay_returns_the_stored_decision_with_unchanged_view() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client = client_addr(4003);
    let txn = write_txn(CLIENT, 1, Timestamp::new(10, CLIENT), b"x", b"1");
    let digest = cluster.digest(&txn);

    let replies = cluster.phase1_all(&txn, 1, client);
    let grouped = cluster.grouped_p1_sigs(&replies);

    let phase2 = Phase2 {
        req_id: 2,
        txn_digest: Some(digest.clone()),
        txn: None,
        decision: CommitDecision::Commit,
        grouped_sigs: grouped,
    };
    cluster.replicas[0].receive(client, Message::Phase2(phase2.clone()));
    let first = direct_messages(&cluster.drain(0));

    // The replay does not even look at the signatures.
    let mut replay = phase2;
    replay.grouped_sigs.clear();
    cluster.replicas[0].receive(client, Message::Phase2(replay));
    let second = direct_messages(&cluster.drain(0));

    let Some((_, Message::Phase2Reply(first))) = first.first() else {
        panic!("expected phase2 reply");
    };
    let Some((_, Message::Phase2Reply(second))) = second.first() else {
        panic!("expected phase2 reply on replay");
    };
    assert_eq!(first.p2_decision.decision, CommitDecision::Commit);
    assert_eq!(first.p2_decision, second.p2_decision);
    assert_eq!(second.p2_decision.view, 0);
}

#[test]
fn writeback_applied_twice_is_a_noop() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client = client_addr(4004);
    let txn = write_txn(CLIENT, 1, Timestamp::new(10, CLIENT), b"x", b"1");
    let digest = cluster.digest(&txn);

    let replies = cluster.phase1_all(&txn, 1, client);
    let wb = Writeback {
        decision: CommitDecision::Commit,
        txn_digest: digest,
        p1_sigs: Some(cluster.grouped_p1_sigs(&replies)),
        p2_sigs: None,
        conflict: None,
    };
    cluster.writeback_all(&wb, client);
    let commits_once = cluster.replicas[0].stats().commits;

    cluster.writeback_all(&wb, client);
    assert_eq!(cluster.replicas[0].stats().commits, commits_once);
}

#[test]
fn read_at_the_high_watermark_is_served_and_above_is_dropped() {
    let params = Params::default();
    let time_delta = params.time_delta;
    let mut cluster = Cluster::new(5, 1, params);
    let client = client_addr(4005);

    // Clock is at zero; the watermark is exactly time_delta.
    cluster.replicas[0].receive(
        client,
        Message::Read(Read {
            req_id: 1,
            key: b"x".to_vec(),
            timestamp: Timestamp::new(time_delta, CLIENT),
        }),
    );
    assert_eq!(direct_messages(&cluster.drain(0)).len(), 1);

    cluster.replicas[0].receive(
        client,
        Message::Read(Read {
            req_id: 2,
            key: b"x".to_vec(),
            timestamp: Timestamp::new(time_delta + 1, CLIENT),
        }),
    );
    assert!(direct_messages(&cluster.drain(0)).is_empty());
}

/// The prepared-write piggyback honors the dependency-depth cap: a chain at
/// exactly the cap is piggybacked, one past it is not, and -2 disables the
/// piggyback entirely.
#[test]
fn read_piggyback_respects_the_depth_cap() {
    let run = |max_dep_depth: i64| {
        let params = Params {
            max_dep_depth,
            ..Params::default()
        };
        let mut cluster = Cluster::new(5, 1, params);
        let client = client_addr(4010);

        // t1 is prepared with no dependencies (depth 0); t2 is prepared on
        // top of it (depth 1).
        let t1 = write_txn(CLIENT, 1, Timestamp::new(10, CLIENT), b"a", b"v1");
        let t1_digest = cluster.digest(&t1);
        cluster.phase1_all(&t1, 1, client);

        let mut t2 = write_txn(CLIENT, 2, Timestamp::new(20, CLIENT), b"b", b"v2");
        let witnesses = cluster.dep_witnesses(
            &common::dep_on(&t1, &t1_digest, Vec::new()).write,
            2,
        );
        t2.deps = vec![common::dep_on(&t1, &t1_digest, witnesses)];
        cluster.phase1_all(&t2, 2, client);
        cluster.drain_all();

        cluster.replicas[0].receive(
            client,
            Message::Read(Read {
                req_id: 9,
                key: b"b".to_vec(),
                timestamp: Timestamp::new(50, CLIENT),
            }),
        );
        let outbound = direct_messages(&cluster.drain(0));
        let Some((_, Message::ReadReply(reply))) = outbound.first() else {
            panic!("expected read reply");
        };
        reply.write.prepared.is_some()
    };

    assert!(run(1), "depth equal to the cap is piggybacked");
    assert!(!run(0), "depth above the cap is not");
    assert!(run(-1), "unlimited depth is piggybacked");
    assert!(!run(-2), "-2 disables the piggyback");
}

#[test]
fn phase1_beyond_the_watermark_abstains() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client = client_addr(4006);
    let far_future = Timestamp::new(1_000_000, CLIENT);
    let txn = write_txn(CLIENT, 1, far_future, b"x", b"1");

    cluster.replicas[0].receive(
        client,
        Message::Phase1(Phase1 {
            req_id: 1,
            txn,
        }),
    );
    let reply = common::take_phase1_reply(&mut cluster.drain(0)).expect("phase1 reply");
    assert_eq!(reply.cc.result, CcResult::Abstain);
}
