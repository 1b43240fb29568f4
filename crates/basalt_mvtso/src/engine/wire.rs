//! Canonical wire encodings for the message family.
//!
//! Everything on the wire is big-endian and length-delimited. The same
//! encoder set produces the signable byte strings carried inside
//! `SignedMessage` envelopes, so a signature always covers a canonical,
//! type-tagged encoding and can be re-parsed by a verifier.

use super::types::{
    Abort, AbortIntent, AttachedView, CcDecision, CcResult, CommitDecision, CommittedProof,
    CommittedValue, CurrentView, DecisionFb, Dependency, Digest, ElectFb, ElectMessage,
    GroupedSignatures, InvokeFb, Message, Phase1, Phase1Fb, Phase1FbReply, Phase1Reply, Phase2,
    Phase2Decision, Phase2Fb, Phase2FbReply, Phase2Reply, PreparedValue, PreparedWrite,
    ProofQuorum, Read, ReadOp, ReadReply, RelayP1, SignedMessage, Timestamp, Transaction,
    VisibleWrite, WriteOp, Writeback,
};

/// Length of a truncated digest when `hash_digest` is configured.
const SHORT_DIGEST_LEN: usize = 16;

/// Type tags distinguishing signable encodings. A signature over one message
/// kind can never validate as another.
const SIG_CC: u8 = 1;
const SIG_P2_DECISION: u8 = 2;
const SIG_CURRENT_VIEW: u8 = 3;
const SIG_ELECT: u8 = 4;
const SIG_WRITE: u8 = 5;
const SIG_ABORT: u8 = 6;

/// Render a hex prefix of `bytes` for log output.
pub fn hex_prefix(bytes: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(2 * max.min(bytes.len()));
    for b in bytes.iter().take(max) {
        out.push_str(&format!("{b:02x}"));
    }
    if bytes.len() > max {
        out.push_str("..");
    }
    out
}

/// Deterministic digest of a transaction's canonical encoding. Dependency
/// signatures are excluded so the digest is stable however the transaction
/// was witnessed.
pub fn transaction_digest(txn: &Transaction, hash_digest: bool) -> Digest {
    let mut buf = Vec::with_capacity(128);
    put_u64(&mut buf, txn.client_id);
    put_u64(&mut buf, txn.client_seq);
    put_timestamp(&mut buf, txn.timestamp);
    put_u32(&mut buf, txn.read_set.len() as u32);
    for read in &txn.read_set {
        put_bytes(&mut buf, &read.key);
        put_timestamp(&mut buf, read.version);
    }
    put_u32(&mut buf, txn.write_set.len() as u32);
    for write in &txn.write_set {
        put_bytes(&mut buf, &write.key);
        put_bytes(&mut buf, &write.value);
    }
    put_u32(&mut buf, txn.deps.len() as u32);
    for dep in &txn.deps {
        put_u64(&mut buf, dep.involved_group);
        put_prepared_write(&mut buf, &dep.write);
    }
    put_u32(&mut buf, txn.involved_groups.len() as u32);
    for group in &txn.involved_groups {
        put_u64(&mut buf, *group);
    }

    let hash = blake3::hash(&buf);
    let bytes = hash.as_bytes();
    if hash_digest {
        Digest(bytes[..SHORT_DIGEST_LEN].to_vec())
    } else {
        Digest(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Signable encodings.

/// Canonical bytes of a Phase-1 concurrency-control vote.
pub fn encode_cc_vote(result: CcResult, txn_digest: &Digest) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + txn_digest.0.len());
    out.push(SIG_CC);
    out.push(cc_result_tag(result));
    put_bytes(&mut out, &txn_digest.0);
    out
}

/// Parse a concurrency-control vote produced by `encode_cc_vote`.
pub fn decode_cc_vote(data: &[u8]) -> anyhow::Result<(CcResult, Digest)> {
    let mut offset = 0usize;
    anyhow::ensure!(read_u8(data, &mut offset)? == SIG_CC, "not a cc vote");
    let result = cc_result_from(read_u8(data, &mut offset)?)?;
    let digest = Digest(read_bytes(data, &mut offset)?);
    Ok((result, digest))
}

/// Canonical bytes of a Phase-2 decision.
pub fn encode_p2_decision(decision: &Phase2Decision) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + decision.txn_digest.0.len() + 8);
    out.push(SIG_P2_DECISION);
    out.push(decision_tag(decision.decision));
    put_bytes(&mut out, &decision.txn_digest.0);
    put_u64(&mut out, decision.view);
    out
}

pub fn decode_p2_decision(data: &[u8]) -> anyhow::Result<Phase2Decision> {
    let mut offset = 0usize;
    anyhow::ensure!(
        read_u8(data, &mut offset)? == SIG_P2_DECISION,
        "not a p2 decision"
    );
    let decision = decision_from(read_u8(data, &mut offset)?)?;
    let txn_digest = Digest(read_bytes(data, &mut offset)?);
    let view = read_u64(data, &mut offset)?;
    Ok(Phase2Decision {
        decision,
        txn_digest,
        view,
    })
}

/// Canonical bytes of a replica's current view for a digest.
pub fn encode_current_view(view: &CurrentView) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + view.txn_digest.0.len() + 16);
    out.push(SIG_CURRENT_VIEW);
    put_bytes(&mut out, &view.txn_digest.0);
    put_u64(&mut out, view.view);
    put_u64(&mut out, view.replica_id);
    out
}

pub fn decode_current_view(data: &[u8]) -> anyhow::Result<CurrentView> {
    let mut offset = 0usize;
    anyhow::ensure!(
        read_u8(data, &mut offset)? == SIG_CURRENT_VIEW,
        "not a current view"
    );
    let txn_digest = Digest(read_bytes(data, &mut offset)?);
    let view = read_u64(data, &mut offset)?;
    let replica_id = read_u64(data, &mut offset)?;
    Ok(CurrentView {
        txn_digest,
        view,
        replica_id,
    })
}

/// Canonical bytes of an elect vote.
pub fn encode_elect_message(elect: &ElectMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + elect.txn_digest.0.len() + 16);
    out.push(SIG_ELECT);
    put_u64(&mut out, elect.req_id);
    put_bytes(&mut out, &elect.txn_digest.0);
    out.push(decision_tag(elect.decision));
    put_u64(&mut out, elect.view);
    out
}

pub fn decode_elect_message(data: &[u8]) -> anyhow::Result<ElectMessage> {
    let mut offset = 0usize;
    anyhow::ensure!(read_u8(data, &mut offset)? == SIG_ELECT, "not an elect");
    let req_id = read_u64(data, &mut offset)?;
    let txn_digest = Digest(read_bytes(data, &mut offset)?);
    let decision = decision_from(read_u8(data, &mut offset)?)?;
    let view = read_u64(data, &mut offset)?;
    Ok(ElectMessage {
        req_id,
        txn_digest,
        decision,
        view,
    })
}

/// Canonical bytes of the write visible to a read, bound to its key.
pub fn encode_visible_write(key: &[u8], write: &VisibleWrite) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + key.len() + 64);
    out.push(SIG_WRITE);
    put_bytes(&mut out, key);
    put_visible_write(&mut out, write);
    out
}

pub fn decode_visible_write(data: &[u8]) -> anyhow::Result<(Vec<u8>, VisibleWrite)> {
    let mut offset = 0usize;
    anyhow::ensure!(read_u8(data, &mut offset)? == SIG_WRITE, "not a write");
    let key = read_bytes(data, &mut offset)?;
    let write = read_visible_write(data, &mut offset)?;
    Ok((key, write))
}

/// Canonical bytes of a client-local abort intent.
pub fn encode_abort_intent(intent: &AbortIntent) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 16 + 4);
    out.push(SIG_ABORT);
    put_timestamp(&mut out, intent.ts);
    put_u32(&mut out, intent.read_set.len() as u32);
    for key in &intent.read_set {
        put_bytes(&mut out, key);
    }
    out
}

pub fn decode_abort_intent(data: &[u8]) -> anyhow::Result<AbortIntent> {
    let mut offset = 0usize;
    anyhow::ensure!(read_u8(data, &mut offset)? == SIG_ABORT, "not an abort");
    let ts = read_timestamp(data, &mut offset)?;
    let count = read_u32(data, &mut offset)? as usize;
    let mut read_set = Vec::with_capacity(count);
    for _ in 0..count {
        read_set.push(read_bytes(data, &mut offset)?);
    }
    Ok(AbortIntent { ts, read_set })
}

// ---------------------------------------------------------------------------
// Full message codec.

const MSG_READ: u8 = 1;
const MSG_READ_REPLY: u8 = 2;
const MSG_PHASE1: u8 = 3;
const MSG_PHASE1_REPLY: u8 = 4;
const MSG_PHASE2: u8 = 5;
const MSG_PHASE2_REPLY: u8 = 6;
const MSG_WRITEBACK: u8 = 7;
const MSG_ABORT: u8 = 8;
const MSG_PHASE1_FB: u8 = 9;
const MSG_PHASE1_FB_REPLY: u8 = 10;
const MSG_PHASE2_FB: u8 = 11;
const MSG_PHASE2_FB_REPLY: u8 = 12;
const MSG_INVOKE_FB: u8 = 13;
const MSG_ELECT_FB: u8 = 14;
const MSG_DECISION_FB: u8 = 15;
const MSG_RELAY_P1: u8 = 16;

/// Encode a message for the datagram transport.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    match msg {
        Message::Read(m) => {
            out.push(MSG_READ);
            put_u64(&mut out, m.req_id);
            put_bytes(&mut out, &m.key);
            put_timestamp(&mut out, m.timestamp);
        }
        Message::ReadReply(m) => {
            out.push(MSG_READ_REPLY);
            put_u64(&mut out, m.req_id);
            put_bytes(&mut out, &m.key);
            put_visible_write(&mut out, &m.write);
            put_option(&mut out, m.proof.as_ref(), put_proof);
            put_option(&mut out, m.signed_write.as_ref(), put_signed);
        }
        Message::Phase1(m) => {
            out.push(MSG_PHASE1);
            put_phase1(&mut out, m);
        }
        Message::Phase1Reply(m) => {
            out.push(MSG_PHASE1_REPLY);
            put_phase1_reply(&mut out, m);
        }
        Message::Phase2(m) => {
            out.push(MSG_PHASE2);
            put_u64(&mut out, m.req_id);
            put_option(&mut out, m.txn_digest.as_ref(), |b, d| put_bytes(b, &d.0));
            put_option(&mut out, m.txn.as_ref(), put_transaction);
            out.push(decision_tag(m.decision));
            put_grouped(&mut out, &m.grouped_sigs);
        }
        Message::Phase2Reply(m) => {
            out.push(MSG_PHASE2_REPLY);
            put_phase2_reply(&mut out, m);
        }
        Message::Writeback(m) => {
            out.push(MSG_WRITEBACK);
            put_writeback(&mut out, m);
        }
        Message::Abort(m) => {
            out.push(MSG_ABORT);
            put_option(&mut out, m.internal.as_ref(), |b, i| {
                put_bytes(b, &encode_abort_intent(i))
            });
            put_option(&mut out, m.signed_internal.as_ref(), put_signed);
        }
        Message::Phase1Fb(m) => {
            out.push(MSG_PHASE1_FB);
            put_u64(&mut out, m.req_id);
            put_transaction(&mut out, &m.txn);
        }
        Message::Phase1FbReply(m) => {
            out.push(MSG_PHASE1_FB_REPLY);
            put_u64(&mut out, m.req_id);
            put_bytes(&mut out, &m.txn_digest.0);
            put_option(&mut out, m.wb.as_ref(), put_writeback);
            put_option(&mut out, m.p1r.as_ref(), put_phase1_reply);
            put_option(&mut out, m.p2r.as_ref(), put_phase2_reply);
            put_attached_view(&mut out, &m.attached_view);
        }
        Message::Phase2Fb(m) => {
            out.push(MSG_PHASE2_FB);
            put_phase2_fb(&mut out, m);
        }
        Message::Phase2FbReply(m) => {
            out.push(MSG_PHASE2_FB_REPLY);
            put_bytes(&mut out, &m.txn_digest.0);
            put_phase2_reply(&mut out, &m.p2r);
            put_attached_view(&mut out, &m.attached_view);
        }
        Message::InvokeFb(m) => {
            out.push(MSG_INVOKE_FB);
            put_u64(&mut out, m.req_id);
            put_bytes(&mut out, &m.txn_digest.0);
            put_u64(&mut out, m.proposed_view);
            out.push(m.catchup as u8);
            put_signed_list(&mut out, &m.view_sigs);
            put_option(&mut out, m.p2fb.as_ref(), put_phase2_fb);
        }
        Message::ElectFb(m) => {
            out.push(MSG_ELECT_FB);
            put_signed(&mut out, &m.signed_elect);
        }
        Message::DecisionFb(m) => {
            out.push(MSG_DECISION_FB);
            put_u64(&mut out, m.req_id);
            put_bytes(&mut out, &m.txn_digest.0);
            out.push(decision_tag(m.decision));
            put_u64(&mut out, m.view);
            put_signed_list(&mut out, &m.elect_sigs);
        }
        Message::RelayP1(m) => {
            out.push(MSG_RELAY_P1);
            put_u64(&mut out, m.conflict_id);
            put_phase1(&mut out, &m.p1);
        }
    }
    out
}

/// Decode a datagram produced by `encode_message`.
pub fn decode_message(data: &[u8]) -> anyhow::Result<Message> {
    let mut offset = 0usize;
    let tag = read_u8(data, &mut offset)?;
    let msg = match tag {
        MSG_READ => Message::Read(Read {
            req_id: read_u64(data, &mut offset)?,
            key: read_bytes(data, &mut offset)?,
            timestamp: read_timestamp(data, &mut offset)?,
        }),
        MSG_READ_REPLY => Message::ReadReply(ReadReply {
            req_id: read_u64(data, &mut offset)?,
            key: read_bytes(data, &mut offset)?,
            write: read_visible_write(data, &mut offset)?,
            proof: read_option(data, &mut offset, read_proof)?,
            signed_write: read_option(data, &mut offset, read_signed)?,
        }),
        MSG_PHASE1 => Message::Phase1(read_phase1(data, &mut offset)?),
        MSG_PHASE1_REPLY => Message::Phase1Reply(read_phase1_reply(data, &mut offset)?),
        MSG_PHASE2 => Message::Phase2(Phase2 {
            req_id: read_u64(data, &mut offset)?,
            txn_digest: read_option(data, &mut offset, |d, o| Ok(Digest(read_bytes(d, o)?)))?,
            txn: read_option(data, &mut offset, read_transaction)?,
            decision: decision_from(read_u8(data, &mut offset)?)?,
            grouped_sigs: read_grouped(data, &mut offset)?,
        }),
        MSG_PHASE2_REPLY => Message::Phase2Reply(read_phase2_reply(data, &mut offset)?),
        MSG_WRITEBACK => Message::Writeback(read_writeback(data, &mut offset)?),
        MSG_ABORT => Message::Abort(Abort {
            internal: read_option(data, &mut offset, |d, o| {
                let raw = read_bytes(d, o)?;
                decode_abort_intent(&raw)
            })?,
            signed_internal: read_option(data, &mut offset, read_signed)?,
        }),
        MSG_PHASE1_FB => Message::Phase1Fb(Phase1Fb {
            req_id: read_u64(data, &mut offset)?,
            txn: read_transaction(data, &mut offset)?,
        }),
        MSG_PHASE1_FB_REPLY => Message::Phase1FbReply(Phase1FbReply {
            req_id: read_u64(data, &mut offset)?,
            txn_digest: Digest(read_bytes(data, &mut offset)?),
            wb: read_option(data, &mut offset, read_writeback)?,
            p1r: read_option(data, &mut offset, read_phase1_reply)?,
            p2r: read_option(data, &mut offset, read_phase2_reply)?,
            attached_view: read_attached_view(data, &mut offset)?,
        }),
        MSG_PHASE2_FB => Message::Phase2Fb(read_phase2_fb(data, &mut offset)?),
        MSG_PHASE2_FB_REPLY => Message::Phase2FbReply(Phase2FbReply {
            txn_digest: Digest(read_bytes(data, &mut offset)?),
            p2r: read_phase2_reply(data, &mut offset)?,
            attached_view: read_attached_view(data, &mut offset)?,
        }),
        MSG_INVOKE_FB => Message::InvokeFb(InvokeFb {
            req_id: read_u64(data, &mut offset)?,
            txn_digest: Digest(read_bytes(data, &mut offset)?),
            proposed_view: read_u64(data, &mut offset)?,
            catchup: read_u8(data, &mut offset)? != 0,
            view_sigs: read_signed_list(data, &mut offset)?,
            p2fb: read_option(data, &mut offset, read_phase2_fb)?,
        }),
        MSG_ELECT_FB => Message::ElectFb(ElectFb {
            signed_elect: read_signed(data, &mut offset)?,
        }),
        MSG_DECISION_FB => Message::DecisionFb(DecisionFb {
            req_id: read_u64(data, &mut offset)?,
            txn_digest: Digest(read_bytes(data, &mut offset)?),
            decision: decision_from(read_u8(data, &mut offset)?)?,
            view: read_u64(data, &mut offset)?,
            elect_sigs: read_signed_list(data, &mut offset)?,
        }),
        MSG_RELAY_P1 => Message::RelayP1(RelayP1 {
            conflict_id: read_u64(data, &mut offset)?,
            p1: read_phase1(data, &mut offset)?,
        }),
        other => anyhow::bail!("unknown message tag {other}"),
    };
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Structure encoders.

fn cc_result_tag(result: CcResult) -> u8 {
    match result {
        CcResult::Commit => 0,
        CcResult::Abstain => 1,
        CcResult::Abort => 2,
        CcResult::Wait => 3,
    }
}

fn cc_result_from(tag: u8) -> anyhow::Result<CcResult> {
    Ok(match tag {
        0 => CcResult::Commit,
        1 => CcResult::Abstain,
        2 => CcResult::Abort,
        3 => CcResult::Wait,
        other => anyhow::bail!("unknown cc result tag {other}"),
    })
}

fn decision_tag(decision: CommitDecision) -> u8 {
    match decision {
        CommitDecision::Commit => 0,
        CommitDecision::Abort => 1,
    }
}

fn decision_from(tag: u8) -> anyhow::Result<CommitDecision> {
    Ok(match tag {
        0 => CommitDecision::Commit,
        1 => CommitDecision::Abort,
        other => anyhow::bail!("unknown decision tag {other}"),
    })
}

fn put_timestamp(out: &mut Vec<u8>, ts: Timestamp) {
    put_u64(out, ts.time);
    put_u64(out, ts.id);
}

fn read_timestamp(data: &[u8], offset: &mut usize) -> anyhow::Result<Timestamp> {
    let time = read_u64(data, offset)?;
    let id = read_u64(data, offset)?;
    Ok(Timestamp { time, id })
}

fn put_signed(out: &mut Vec<u8>, sm: &SignedMessage) {
    put_u64(out, sm.process_id);
    put_bytes(out, &sm.data);
    put_bytes(out, &sm.signature);
}

fn read_signed(data: &[u8], offset: &mut usize) -> anyhow::Result<SignedMessage> {
    Ok(SignedMessage {
        process_id: read_u64(data, offset)?,
        data: read_bytes(data, offset)?,
        signature: read_bytes(data, offset)?,
    })
}

fn put_signed_list(out: &mut Vec<u8>, sigs: &[SignedMessage]) {
    put_u32(out, sigs.len() as u32);
    for sm in sigs {
        put_signed(out, sm);
    }
}

fn read_signed_list(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<SignedMessage>> {
    let count = read_u32(data, offset)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(read_signed(data, offset)?);
    }
    Ok(out)
}

fn put_grouped(out: &mut Vec<u8>, grouped: &GroupedSignatures) {
    put_u32(out, grouped.len() as u32);
    for (group, sigs) in grouped {
        put_u64(out, *group);
        put_signed_list(out, sigs);
    }
}

fn read_grouped(data: &[u8], offset: &mut usize) -> anyhow::Result<GroupedSignatures> {
    let count = read_u32(data, offset)? as usize;
    let mut out = GroupedSignatures::new();
    for _ in 0..count {
        let group = read_u64(data, offset)?;
        let sigs = read_signed_list(data, offset)?;
        out.insert(group, sigs);
    }
    Ok(out)
}

fn put_prepared_write(out: &mut Vec<u8>, write: &PreparedWrite) {
    put_bytes(out, &write.key);
    put_bytes(out, &write.value);
    put_timestamp(out, write.timestamp);
    put_bytes(out, &write.txn_digest.0);
}

fn read_prepared_write(data: &[u8], offset: &mut usize) -> anyhow::Result<PreparedWrite> {
    Ok(PreparedWrite {
        key: read_bytes(data, offset)?,
        value: read_bytes(data, offset)?,
        timestamp: read_timestamp(data, offset)?,
        txn_digest: Digest(read_bytes(data, offset)?),
    })
}

fn put_transaction(out: &mut Vec<u8>, txn: &Transaction) {
    put_u64(out, txn.client_id);
    put_u64(out, txn.client_seq);
    put_timestamp(out, txn.timestamp);
    put_u32(out, txn.read_set.len() as u32);
    for read in &txn.read_set {
        put_bytes(out, &read.key);
        put_timestamp(out, read.version);
    }
    put_u32(out, txn.write_set.len() as u32);
    for write in &txn.write_set {
        put_bytes(out, &write.key);
        put_bytes(out, &write.value);
    }
    put_u32(out, txn.deps.len() as u32);
    for dep in &txn.deps {
        put_u64(out, dep.involved_group);
        put_prepared_write(out, &dep.write);
        put_signed_list(out, &dep.write_sigs);
    }
    put_u32(out, txn.involved_groups.len() as u32);
    for group in &txn.involved_groups {
        put_u64(out, *group);
    }
}

fn read_transaction(data: &[u8], offset: &mut usize) -> anyhow::Result<Transaction> {
    let client_id = read_u64(data, offset)?;
    let client_seq = read_u64(data, offset)?;
    let timestamp = read_timestamp(data, offset)?;

    let read_count = read_u32(data, offset)? as usize;
    let mut read_set = Vec::with_capacity(read_count.min(1024));
    for _ in 0..read_count {
        read_set.push(ReadOp {
            key: read_bytes(data, offset)?,
            version: read_timestamp(data, offset)?,
        });
    }

    let write_count = read_u32(data, offset)? as usize;
    let mut write_set = Vec::with_capacity(write_count.min(1024));
    for _ in 0..write_count {
        write_set.push(WriteOp {
            key: read_bytes(data, offset)?,
            value: read_bytes(data, offset)?,
        });
    }

    let dep_count = read_u32(data, offset)? as usize;
    let mut deps = Vec::with_capacity(dep_count.min(1024));
    for _ in 0..dep_count {
        deps.push(Dependency {
            involved_group: read_u64(data, offset)?,
            write: read_prepared_write(data, offset)?,
            write_sigs: read_signed_list(data, offset)?,
        });
    }

    let group_count = read_u32(data, offset)? as usize;
    let mut involved_groups = Vec::with_capacity(group_count.min(1024));
    for _ in 0..group_count {
        involved_groups.push(read_u64(data, offset)?);
    }

    Ok(Transaction {
        client_id,
        client_seq,
        timestamp,
        read_set,
        write_set,
        deps,
        involved_groups,
    })
}

fn put_proof(out: &mut Vec<u8>, proof: &CommittedProof) {
    put_transaction(out, &proof.txn);
    match &proof.quorum {
        ProofQuorum::Genesis => out.push(0),
        ProofQuorum::Phase1(grouped) => {
            out.push(1);
            put_grouped(out, grouped);
        }
        ProofQuorum::Phase2(sigs) => {
            out.push(2);
            put_signed_list(out, sigs);
        }
    }
}

fn read_proof(data: &[u8], offset: &mut usize) -> anyhow::Result<CommittedProof> {
    let txn = read_transaction(data, offset)?;
    let quorum = match read_u8(data, offset)? {
        0 => ProofQuorum::Genesis,
        1 => ProofQuorum::Phase1(read_grouped(data, offset)?),
        2 => ProofQuorum::Phase2(read_signed_list(data, offset)?),
        other => anyhow::bail!("unknown proof quorum tag {other}"),
    };
    Ok(CommittedProof { txn, quorum })
}

fn put_visible_write(out: &mut Vec<u8>, write: &VisibleWrite) {
    put_option(out, write.committed.as_ref(), |b, c| {
        put_bytes(b, &c.value);
        put_timestamp(b, c.timestamp);
    });
    put_option(out, write.prepared.as_ref(), |b, p| {
        put_bytes(b, &p.value);
        put_timestamp(b, p.timestamp);
        put_bytes(b, &p.txn_digest.0);
    });
}

fn read_visible_write(data: &[u8], offset: &mut usize) -> anyhow::Result<VisibleWrite> {
    let committed = read_option(data, offset, |d, o| {
        Ok(CommittedValue {
            value: read_bytes(d, o)?,
            timestamp: read_timestamp(d, o)?,
        })
    })?;
    let prepared = read_option(data, offset, |d, o| {
        Ok(PreparedValue {
            value: read_bytes(d, o)?,
            timestamp: read_timestamp(d, o)?,
            txn_digest: Digest(read_bytes(d, o)?),
        })
    })?;
    Ok(VisibleWrite {
        committed,
        prepared,
    })
}

fn put_phase1(out: &mut Vec<u8>, m: &Phase1) {
    put_u64(out, m.req_id);
    put_transaction(out, &m.txn);
}

fn read_phase1(data: &[u8], offset: &mut usize) -> anyhow::Result<Phase1> {
    Ok(Phase1 {
        req_id: read_u64(data, offset)?,
        txn: read_transaction(data, offset)?,
    })
}

fn put_phase1_reply(out: &mut Vec<u8>, m: &Phase1Reply) {
    put_u64(out, m.req_id);
    out.push(cc_result_tag(m.cc.result));
    put_option(out, m.cc.txn_digest.as_ref(), |b, d| put_bytes(b, &d.0));
    put_option(out, m.cc.conflict.as_ref(), put_proof);
    put_option(out, m.signed_cc.as_ref(), put_signed);
}

fn read_phase1_reply(data: &[u8], offset: &mut usize) -> anyhow::Result<Phase1Reply> {
    let req_id = read_u64(data, offset)?;
    let result = cc_result_from(read_u8(data, offset)?)?;
    let txn_digest = read_option(data, offset, |d, o| Ok(Digest(read_bytes(d, o)?)))?;
    let conflict = read_option(data, offset, read_proof)?;
    let signed_cc = read_option(data, offset, read_signed)?;
    Ok(Phase1Reply {
        req_id,
        cc: CcDecision {
            result,
            txn_digest,
            conflict,
        },
        signed_cc,
    })
}

fn put_phase2_reply(out: &mut Vec<u8>, m: &Phase2Reply) {
    put_u64(out, m.req_id);
    out.push(decision_tag(m.p2_decision.decision));
    put_bytes(out, &m.p2_decision.txn_digest.0);
    put_u64(out, m.p2_decision.view);
    put_option(out, m.signed_p2_decision.as_ref(), put_signed);
}

fn read_phase2_reply(data: &[u8], offset: &mut usize) -> anyhow::Result<Phase2Reply> {
    Ok(Phase2Reply {
        req_id: read_u64(data, offset)?,
        p2_decision: Phase2Decision {
            decision: decision_from(read_u8(data, offset)?)?,
            txn_digest: Digest(read_bytes(data, offset)?),
            view: read_u64(data, offset)?,
        },
        signed_p2_decision: read_option(data, offset, read_signed)?,
    })
}

fn put_writeback(out: &mut Vec<u8>, m: &Writeback) {
    out.push(decision_tag(m.decision));
    put_bytes(out, &m.txn_digest.0);
    put_option(out, m.p1_sigs.as_ref(), put_grouped);
    put_option(out, m.p2_sigs.as_deref(), |b, s| put_signed_list(b, s));
    put_option(out, m.conflict.as_ref(), put_proof);
}

fn read_writeback(data: &[u8], offset: &mut usize) -> anyhow::Result<Writeback> {
    Ok(Writeback {
        decision: decision_from(read_u8(data, offset)?)?,
        txn_digest: Digest(read_bytes(data, offset)?),
        p1_sigs: read_option(data, offset, read_grouped)?,
        p2_sigs: read_option(data, offset, read_signed_list)?,
        conflict: read_option(data, offset, read_proof)?,
    })
}

fn put_phase2_fb(out: &mut Vec<u8>, m: &Phase2Fb) {
    put_u64(out, m.req_id);
    put_bytes(out, &m.txn_digest.0);
    put_option(out, m.txn.as_ref(), put_transaction);
    out.push(decision_tag(m.decision));
    put_u32(out, m.p2_replies.len() as u32);
    for reply in &m.p2_replies {
        put_phase2_reply(out, reply);
    }
    put_option(out, m.grouped_sigs.as_ref(), put_grouped);
}

fn read_phase2_fb(data: &[u8], offset: &mut usize) -> anyhow::Result<Phase2Fb> {
    let req_id = read_u64(data, offset)?;
    let txn_digest = Digest(read_bytes(data, offset)?);
    let txn = read_option(data, offset, read_transaction)?;
    let decision = decision_from(read_u8(data, offset)?)?;
    let count = read_u32(data, offset)? as usize;
    let mut p2_replies = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        p2_replies.push(read_phase2_reply(data, offset)?);
    }
    let grouped_sigs = read_option(data, offset, read_grouped)?;
    Ok(Phase2Fb {
        req_id,
        txn_digest,
        txn,
        decision,
        p2_replies,
        grouped_sigs,
    })
}

fn put_attached_view(out: &mut Vec<u8>, view: &AttachedView) {
    put_bytes(out, &view.current_view.txn_digest.0);
    put_u64(out, view.current_view.view);
    put_u64(out, view.current_view.replica_id);
    put_option(out, view.signed_current_view.as_ref(), put_signed);
}

fn read_attached_view(data: &[u8], offset: &mut usize) -> anyhow::Result<AttachedView> {
    Ok(AttachedView {
        current_view: CurrentView {
            txn_digest: Digest(read_bytes(data, offset)?),
            view: read_u64(data, offset)?,
            replica_id: read_u64(data, offset)?,
        },
        signed_current_view: read_option(data, offset, read_signed)?,
    })
}

// ---------------------------------------------------------------------------
// Primitive helpers.

fn put_option<T: ?Sized>(out: &mut Vec<u8>, value: Option<&T>, put: impl FnOnce(&mut Vec<u8>, &T)) {
    match value {
        None => out.push(0),
        Some(v) => {
            out.push(1);
            put(out, v);
        }
    }
}

fn read_option<T>(
    data: &[u8],
    offset: &mut usize,
    read: impl FnOnce(&[u8], &mut usize) -> anyhow::Result<T>,
) -> anyhow::Result<Option<T>> {
    match read_u8(data, offset)? {
        0 => Ok(None),
        1 => Ok(Some(read(data, offset)?)),
        other => anyhow::bail!("invalid option tag {other}"),
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short bytes");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}
