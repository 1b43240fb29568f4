//! Shared harness for protocol tests.
//!
//! The engine is synchronous and single-threaded, so the harness drives a
//! replica group directly: a recording transport captures every outbound
//! message and timer, a manual clock controls the fallback gates, and the
//! tests deliver messages between replicas by hand.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use basalt_mvtso::engine::{
    encode_current_view, encode_visible_write, transaction_digest, Address, CcResult,
    CommitDecision, CurrentView, Dependency, Digest, GroupConfig, GroupId, GroupedSignatures,
    HashPartitioner, KeyManager, Message, Params, Phase1, Phase1Reply, PreparedValue,
    PreparedWrite, ReadOp, Replica, SeedKeyManager, SignedMessage, TimeSource, TimerEvent,
    Timestamp, Transaction, Transport, VisibleWrite, Writeback, WriteOp,
};

/// Client slots in the key manager beyond the replica ids.
pub const CLIENT_KEY_SLOTS: usize = 16;

/// Everything a replica pushed out, in order.
#[derive(Clone, Debug)]
pub enum Outbound {
    Direct(Address, Message),
    Replica(GroupId, usize, Message),
    Group(GroupId, Message),
    Timer(u64, Address, Message),
}

#[derive(Default)]
pub struct RecordingTransport {
    outbox: Mutex<VecDeque<Outbound>>,
}

impl RecordingTransport {
    pub fn drain(&self) -> Vec<Outbound> {
        self.outbox.lock().unwrap().drain(..).collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: Address, msg: Message) {
        self.outbox
            .lock()
            .unwrap()
            .push_back(Outbound::Direct(to, msg));
    }

    fn send_replica(&self, group: GroupId, replica: usize, msg: Message) {
        self.outbox
            .lock()
            .unwrap()
            .push_back(Outbound::Replica(group, replica, msg));
    }

    fn send_group(&self, group: GroupId, msg: Message) {
        self.outbox
            .lock()
            .unwrap()
            .push_back(Outbound::Group(group, msg));
    }

    fn timer(&self, delay_ms: u64, event: TimerEvent) {
        self.outbox
            .lock()
            .unwrap()
            .push_back(Outbound::Timer(delay_ms, event.from, event.msg));
    }
}

/// Clock the tests advance by hand. Logical time is microseconds derived
/// from the millisecond counter, like the production source.
#[derive(Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> u64 {
        self.ms.load(Ordering::SeqCst) * 1000
    }

    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// One shard group of replicas under test.
pub struct Cluster {
    pub cfg: GroupConfig,
    pub params: Params,
    pub km: Arc<SeedKeyManager>,
    pub clock: Arc<ManualClock>,
    pub replicas: Vec<Replica>,
    transports: Vec<Arc<RecordingTransport>>,
}

impl Cluster {
    pub fn new(n: usize, f: usize, params: Params) -> Self {
        let cfg = GroupConfig {
            n,
            f,
            num_groups: 1,
        };
        let km = Arc::new(SeedKeyManager::new(n + CLIENT_KEY_SLOTS, b"basalt-tests"));
        let clock = Arc::new(ManualClock::default());
        let mut replicas = Vec::with_capacity(n);
        let mut transports = Vec::with_capacity(n);
        for idx in 0..n {
            let transport = Arc::new(RecordingTransport::default());
            replicas.push(Replica::new(
                cfg,
                0,
                idx,
                params.clone(),
                transport.clone(),
                km.clone(),
                Arc::new(HashPartitioner),
                clock.clone(),
            ));
            transports.push(transport);
        }
        Self {
            cfg,
            params,
            km,
            clock,
            replicas,
            transports,
        }
    }

    pub fn drain(&self, idx: usize) -> Vec<Outbound> {
        self.transports[idx].drain()
    }

    pub fn drain_all(&self) {
        for transport in &self.transports {
            transport.drain();
        }
    }

    pub fn digest(&self, txn: &Transaction) -> Digest {
        transaction_digest(txn, self.params.hash_digest)
    }

    /// Deliver a Phase1 for `txn` to every replica and collect the replies.
    /// Waiting replicas contribute no reply.
    pub fn phase1_all(
        &mut self,
        txn: &Transaction,
        req_id: u64,
        client: Address,
    ) -> Vec<Option<Phase1Reply>> {
        let mut replies = Vec::with_capacity(self.replicas.len());
        for idx in 0..self.replicas.len() {
            self.replicas[idx].receive(
                client,
                Message::Phase1(Phase1 {
                    req_id,
                    txn: txn.clone(),
                }),
            );
            replies.push(take_phase1_reply(&mut self.drain(idx)));
        }
        replies
    }

    /// Collect the signed commit votes of Phase1 replies into the grouped
    /// form that Phase2 and Writeback expect.
    pub fn grouped_p1_sigs(&self, replies: &[Option<Phase1Reply>]) -> GroupedSignatures {
        let sigs: Vec<SignedMessage> = replies
            .iter()
            .flatten()
            .filter_map(|reply| reply.signed_cc.clone())
            .collect();
        let mut grouped = GroupedSignatures::new();
        grouped.insert(0, sigs);
        grouped
    }

    /// Deliver a writeback to every replica.
    pub fn writeback_all(&mut self, wb: &Writeback, client: Address) {
        for idx in 0..self.replicas.len() {
            self.replicas[idx].receive(client, Message::Writeback(wb.clone()));
        }
    }

    /// Commit a transaction on every replica through the fast path.
    pub fn commit_fast(&mut self, txn: &Transaction, req_id: u64, client: Address) -> Digest {
        let digest = self.digest(txn);
        let replies = self.phase1_all(txn, req_id, client);
        for reply in &replies {
            let reply = reply.as_ref().expect("fast path expects immediate replies");
            assert_eq!(reply.cc.result, CcResult::Commit);
        }
        let wb = Writeback {
            decision: CommitDecision::Commit,
            txn_digest: digest.clone(),
            p1_sigs: Some(self.grouped_p1_sigs(&replies)),
            p2_sigs: None,
            conflict: None,
        };
        self.writeback_all(&wb, client);
        self.drain_all();
        digest
    }

    /// Signed current-view attestations from the first `count` replicas, as
    /// an InvokeFb expects them.
    pub fn view_sigs(&self, digest: &Digest, view: u64, count: usize) -> Vec<SignedMessage> {
        (0..count)
            .map(|idx| {
                let id = self.cfg.process_id(0, idx);
                let current_view = CurrentView {
                    txn_digest: digest.clone(),
                    view,
                    replica_id: id,
                };
                let data = encode_current_view(&current_view);
                let signature = self.km.sign(id, &data).expect("replica key");
                SignedMessage {
                    process_id: id,
                    data,
                    signature,
                }
            })
            .collect()
    }

    /// Replica witnesses for a prepared write, as carried by a dependency.
    pub fn dep_witnesses(&self, write: &PreparedWrite, count: usize) -> Vec<SignedMessage> {
        (0..count)
            .map(|idx| {
                let id = self.cfg.process_id(0, idx);
                let visible = VisibleWrite {
                    committed: None,
                    prepared: Some(PreparedValue {
                        value: write.value.clone(),
                        timestamp: write.timestamp,
                        txn_digest: write.txn_digest.clone(),
                    }),
                };
                let data = encode_visible_write(&write.key, &visible);
                let signature = self.km.sign(id, &data).expect("replica key");
                SignedMessage {
                    process_id: id,
                    data,
                    signature,
                }
            })
            .collect()
    }
}

pub fn client_addr(port: u16) -> Address {
    format!("10.0.0.1:{port}").parse().unwrap()
}

pub fn write_txn(client_id: u64, seq: u64, ts: Timestamp, key: &[u8], value: &[u8]) -> Transaction {
    Transaction {
        client_id,
        client_seq: seq,
        timestamp: ts,
        read_set: Vec::new(),
        write_set: vec![WriteOp {
            key: key.to_vec(),
            value: value.to_vec(),
        }],
        deps: Vec::new(),
        involved_groups: vec![0],
    }
}

pub fn read_txn(
    client_id: u64,
    seq: u64,
    ts: Timestamp,
    key: &[u8],
    read_version: Timestamp,
) -> Transaction {
    Transaction {
        client_id,
        client_seq: seq,
        timestamp: ts,
        read_set: vec![ReadOp {
            key: key.to_vec(),
            version: read_version,
        }],
        write_set: Vec::new(),
        deps: Vec::new(),
        involved_groups: vec![0],
    }
}

pub fn dep_on(txn: &Transaction, digest: &Digest, witnesses: Vec<SignedMessage>) -> Dependency {
    let write = txn
        .write_set
        .first()
        .expect("dependency target must write something");
    Dependency {
        involved_group: 0,
        write: PreparedWrite {
            key: write.key.clone(),
            value: write.value.clone(),
            timestamp: txn.timestamp,
            txn_digest: digest.clone(),
        },
        write_sigs: witnesses,
    }
}

/// Pull the first Phase1Reply out of an outbox drain, if any.
pub fn take_phase1_reply(outbound: &mut Vec<Outbound>) -> Option<Phase1Reply> {
    outbound.iter().find_map(|out| match out {
        Outbound::Direct(_, Message::Phase1Reply(reply)) => Some(reply.clone()),
        _ => None,
    })
}

/// All direct messages of a drain, flattened.
pub fn direct_messages(outbound: &[Outbound]) -> Vec<(Address, Message)> {
    outbound
        .iter()
        .filter_map(|out| match out {
            Outbound::Direct(to, msg) => Some((*to, msg.clone())),
            _ => None,
        })
        .collect()
}

/// All pending timers of a drain: (delay, from, message).
pub fn timers(outbound: &[Outbound]) -> Vec<(u64, Address, Message)> {
    outbound
        .iter()
        .filter_map(|out| match out {
            Outbound::Timer(delay, from, msg) => Some((*delay, *from, msg.clone())),
            _ => None,
        })
        .collect()
}
