//! MVTSO conflict rules: aborts with committed proofs, abstains on
//! prepared state and read-timestamp intents.

mod common;

use basalt_mvtso::engine::{
    validate_committed_conflict, CcResult, CommitDecision, Message, Params, Phase1, Read,
    Timestamp, Writeback,
};
use common::{client_addr, read_txn, take_phase1_reply, write_txn, Cluster};

/// Scenario: T1 committed at (20, 1) writing y. T2 at (30, 2) read y at
/// version (5, 0), missing T1's write. Phase-1 must abort T2 and hand back
/// T1's commit proof as the witness.
#[test]
fn write_read_conflict_aborts_with_committed_proof() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client1 = client_addr(4100);
    let client2 = client_addr(4101);

    let t1 = write_txn(1, 1, Timestamp::new(20, 1), b"y", b"v1");
    cluster.commit_fast(&t1, 1, client1);

    let t2 = read_txn(2, 1, Timestamp::new(30, 2), b"y", Timestamp::new(5, 0));
    let t2_digest = cluster.digest(&t2);
    let replies = cluster.phase1_all(&t2, 2, client2);

    let cfg = cluster.cfg;
    let params = cluster.params.clone();
    for reply in &replies {
        let reply = reply.as_ref().expect("immediate reply");
        assert_eq!(reply.cc.result, CcResult::Abort);
        let conflict = reply.cc.conflict.as_ref().expect("conflict proof");
        assert_eq!(cluster.digest(&conflict.txn), cluster.digest(&t1));
        assert!(validate_committed_conflict(
            conflict,
            &t2,
            &cfg,
            &params,
            cluster.km.as_ref()
        ));
    }

    // The client can finish T2 with a fast abort carrying the conflict.
    let conflict = replies[0]
        .as_ref()
        .unwrap()
        .cc
        .conflict
        .clone()
        .expect("conflict proof");
    let wb = Writeback {
        decision: CommitDecision::Abort,
        txn_digest: t2_digest,
        p1_sigs: None,
        p2_sigs: None,
        conflict: Some(conflict),
    };
    cluster.writeback_all(&wb, client2);
    assert_eq!(cluster.replicas[0].stats().aborts, 1);

    // Replaying Phase-1 after the abort returns the stored abort.
    let replay = cluster.phase1_all(&t2, 2, client2);
    assert_eq!(replay[0].as_ref().unwrap().cc.result, CcResult::Abort);
}

/// A committed reader that missed our write forces an abort, witnessed by
/// the reader's own commit proof.
#[test]
fn committed_read_conflict_aborts_the_writer() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let reader_client = client_addr(4102);
    let writer_client = client_addr(4103);

    // The reader read k at version (0,0) and committed at (40, 1).
    let reader = read_txn(1, 1, Timestamp::new(40, 1), b"k", Timestamp::zero());
    cluster.commit_fast(&reader, 1, reader_client);

    // A writer at (20, 2) would invalidate that read.
    let writer = write_txn(2, 1, Timestamp::new(20, 2), b"k", b"late");
    let replies = cluster.phase1_all(&writer, 2, writer_client);
    for reply in &replies {
        let reply = reply.as_ref().expect("immediate reply");
        assert_eq!(reply.cc.result, CcResult::Abort);
        let conflict = reply.cc.conflict.as_ref().expect("conflict proof");
        assert_eq!(cluster.digest(&conflict.txn), cluster.digest(&reader));
    }
}

/// A prepared (uncommitted) write inside a reader's window is an abstain,
/// not an abort: nothing committed can prove the conflict yet.
#[test]
fn prepared_write_in_read_window_abstains() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let client1 = client_addr(4104);
    let client2 = client_addr(4105);

    let t1 = write_txn(1, 1, Timestamp::new(20, 1), b"z", b"pending");
    let replies = cluster.phase1_all(&t1, 1, client1);
    assert_eq!(replies[0].as_ref().unwrap().cc.result, CcResult::Commit);
    // No writeback: T1 stays prepared.

    let t2 = read_txn(2, 1, Timestamp::new(30, 2), b"z", Timestamp::new(5, 0));
    let replies = cluster.phase1_all(&t2, 2, client2);
    for reply in &replies {
        assert_eq!(reply.as_ref().unwrap().cc.result, CcResult::Abstain);
    }
}

/// Read-timestamp intents: only a strictly greater reader blocks a writer.
/// An rts entry equal to the writer's own timestamp is skipped.
#[test]
fn rts_blocks_only_strictly_older_writers() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let reader = client_addr(4106);
    let writer = client_addr(4107);

    // A read at (50, 3) records its intent on every replica.
    for idx in 0..5 {
        cluster.replicas[idx].receive(
            reader,
            Message::Read(Read {
                req_id: 1,
                key: b"w".to_vec(),
                timestamp: Timestamp::new(50, 3),
            }),
        );
    }
    cluster.drain_all();

    // A writer below the recorded read abstains.
    let below = write_txn(2, 1, Timestamp::new(40, 2), b"w", b"old");
    let replies = cluster.phase1_all(&below, 2, writer);
    assert_eq!(replies[0].as_ref().unwrap().cc.result, CcResult::Abstain);

    // A writer at exactly the recorded timestamp is not blocked by it.
    let equal = write_txn(3, 1, Timestamp::new(50, 3), b"w", b"same");
    let replies = cluster.phase1_all(&equal, 3, writer);
    assert_eq!(replies[0].as_ref().unwrap().cc.result, CcResult::Commit);
}

/// After a commit at ts, all rts entries at or below ts are purged: a new
/// writer below the commit aborts on the committed version, not on rts.
#[test]
fn commit_purges_rts_at_or_below_its_timestamp() {
    let mut cluster = Cluster::new(5, 1, Params::default());
    let reader = client_addr(4108);
    let writer_client = client_addr(4109);

    for idx in 0..5 {
        cluster.replicas[idx].receive(
            reader,
            Message::Read(Read {
                req_id: 1,
                key: b"p".to_vec(),
                timestamp: Timestamp::new(30, 3),
            }),
        );
    }
    cluster.drain_all();

    // Commit a write at (60, 1), above the recorded rts.
    let t1 = write_txn(1, 1, Timestamp::new(60, 1), b"p", b"v1");
    cluster.commit_fast(&t1, 1, writer_client);

    // A writer at (40, 2): the rts at (30, 3) is gone (purged by the
    // commit), and no committed read blocks it, so the only obstacle
    // would have been rts. It prepares cleanly.
    let t2 = write_txn(2, 1, Timestamp::new(40, 2), b"p", b"v2");
    let replies = cluster.phase1_all(&t2, 2, writer_client);
    assert_eq!(replies[0].as_ref().unwrap().cc.result, CcResult::Commit);
}

/// Without proof validation the abort carries no proof but the decision is
/// the same.
#[test]
fn unsigned_mode_still_aborts_on_conflicts() {
    let params = Params {
        signed_messages: false,
        validate_proofs: false,
        verify_deps: false,
        ..Params::default()
    };
    let mut cluster = Cluster::new(5, 1, params);
    let client = client_addr(4110);

    let t1 = write_txn(1, 1, Timestamp::new(20, 1), b"q", b"v1");
    let replies = cluster.phase1_all(&t1, 1, client);
    assert_eq!(replies[0].as_ref().unwrap().cc.result, CcResult::Commit);
    let wb = Writeback {
        decision: CommitDecision::Commit,
        txn_digest: cluster.digest(&t1),
        p1_sigs: None,
        p2_sigs: None,
        conflict: None,
    };
    cluster.writeback_all(&wb, client);
    cluster.drain_all();

    let t2 = read_txn(2, 1, Timestamp::new(30, 2), b"q", Timestamp::new(5, 0));
    cluster.replicas[0].receive(
        client,
        Message::Phase1(Phase1 {
            req_id: 2,
            txn: t2,
        }),
    );
    let reply = take_phase1_reply(&mut cluster.drain(0)).expect("phase1 reply");
    assert_eq!(reply.cc.result, CcResult::Abort);
    assert!(reply.cc.conflict.is_none());
}
