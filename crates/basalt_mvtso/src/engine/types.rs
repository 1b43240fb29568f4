//! Shared types for the replica engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the engine, the verification layer, and the transport/node layers.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::wire;

/// Logical identifier for a shard group.
pub type GroupId = u64;
/// Process identifier: `group * n + replica_index` for replicas; clients use
/// ids beyond the replica range.
pub type ProcessId = u64;
/// Client-chosen request identifier echoed in replies.
pub type ReqId = u64;
/// Network address of a peer or client.
pub type Address = SocketAddr;

/// Multi-version timestamp: logical time plus the issuing client id.
/// The derived ordering is lexicographic, which is the protocol's total order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub time: u64,
    pub id: u64,
}

impl Timestamp {
    pub const fn new(time: u64, id: u64) -> Self {
        Self { time, id }
    }

    pub const fn zero() -> Self {
        Self { time: 0, id: 0 }
    }
}

/// Opaque deterministic fingerprint of a transaction; the protocol's identity
/// key. Full BLAKE3 output, or a truncated prefix when `hash_digest` is set.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub Vec<u8>);

impl Digest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First byte of the digest, used for logging-shard and coordinator
    /// selection. Empty digests map to zero.
    pub fn first_byte(&self) -> u8 {
        self.0.first().copied().unwrap_or(0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", wire::hex_prefix(&self.0, 8))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", wire::hex_prefix(&self.0, 8))
    }
}

/// One read-set entry: the key and the version the client read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOp {
    pub key: Vec<u8>,
    pub version: Timestamp,
}

/// One write-set entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOp {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A prepared (not yet committed) write observed by a reader and declared as
/// a dependency.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreparedWrite {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
    pub txn_digest: Digest,
}

/// A dependency on a prepared transaction in some involved group, optionally
/// witnessed by replica signatures over the read replies that exposed it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependency {
    pub involved_group: GroupId,
    pub write: PreparedWrite,
    pub write_sigs: Vec<SignedMessage>,
}

/// A transaction as submitted by a client. Immutable once seen by a replica.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    pub client_id: u64,
    pub client_seq: u64,
    pub timestamp: Timestamp,
    pub read_set: Vec<ReadOp>,
    pub write_set: Vec<WriteOp>,
    pub deps: Vec<Dependency>,
    pub involved_groups: Vec<GroupId>,
}

impl Transaction {
    /// The logging shard responsible for this transaction's fallback: the
    /// first digest byte indexes into the involved-groups list.
    pub fn logging_shard(&self, digest: &Digest) -> Option<GroupId> {
        if self.involved_groups.is_empty() {
            return None;
        }
        let idx = digest.first_byte() as usize % self.involved_groups.len();
        Some(self.involved_groups[idx])
    }
}

/// Signature envelope: `data` is the canonical encoding of an inner message,
/// signed by `process_id`. When signatures are disabled the signature bytes
/// are empty and never verified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedMessage {
    pub process_id: ProcessId,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Signatures grouped by shard group, ordered for canonical encoding.
pub type GroupedSignatures = BTreeMap<GroupId, Vec<SignedMessage>>;

/// Outcome of the Phase-1 concurrency-control check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcResult {
    Commit,
    Abstain,
    Abort,
    Wait,
}

/// Final cross-shard decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitDecision {
    Commit,
    Abort,
}

/// The quorum evidence inside a committed proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProofQuorum {
    /// Seeded data loaded before execution; carries no signatures.
    Genesis,
    /// Fast path: Phase-1 replies from every involved group.
    Phase1(GroupedSignatures),
    /// Slow path: Phase-2 replies from the logging shard.
    Phase2(Vec<SignedMessage>),
}

/// Cryptographic witness justifying a commit decision to third parties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedProof {
    pub txn: Transaction,
    pub quorum: ProofQuorum,
}

impl CommittedProof {
    /// Proof used for bulk-loaded data.
    pub fn genesis() -> Self {
        Self {
            txn: Transaction::default(),
            quorum: ProofQuorum::Genesis,
        }
    }
}

/// A committed value plus the proof that justifies serving it.
#[derive(Clone, Debug)]
pub struct Value {
    pub data: Vec<u8>,
    pub proof: Arc<CommittedProof>,
}

/// MVCC read request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Read {
    pub req_id: ReqId,
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

/// The committed portion of a read result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommittedValue {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

/// The prepared portion of a read result (dependency piggyback).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreparedValue {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
    pub txn_digest: Digest,
}

/// The write visible to a read: committed version, prepared piggyback, or
/// neither (miss).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisibleWrite {
    pub committed: Option<CommittedValue>,
    pub prepared: Option<PreparedValue>,
}

/// Reply to `Read`. `signed_write` covers the key and the visible write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadReply {
    pub req_id: ReqId,
    pub key: Vec<u8>,
    pub write: VisibleWrite,
    pub proof: Option<CommittedProof>,
    pub signed_write: Option<SignedMessage>,
}

/// Phase-1 request carrying the full transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase1 {
    pub req_id: ReqId,
    pub txn: Transaction,
}

/// The concurrency-control vote inside a Phase-1 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CcDecision {
    pub result: CcResult,
    pub txn_digest: Option<Digest>,
    pub conflict: Option<CommittedProof>,
}

/// Reply to `Phase1`. `signed_cc` covers (result, digest) for quorum use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase1Reply {
    pub req_id: ReqId,
    pub cc: CcDecision,
    pub signed_cc: Option<SignedMessage>,
}

/// Phase-2 request: the client-chosen decision plus the Phase-1 quorum that
/// supports it. Either the digest (txn already known) or the inline txn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase2 {
    pub req_id: ReqId,
    pub txn_digest: Option<Digest>,
    pub txn: Option<Transaction>,
    pub decision: CommitDecision,
    pub grouped_sigs: GroupedSignatures,
}

/// The signable decision inside a Phase-2 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase2Decision {
    pub decision: CommitDecision,
    pub txn_digest: Digest,
    pub view: u64,
}

/// Reply to `Phase2` (and the payload of fallback decision replies).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase2Reply {
    pub req_id: ReqId,
    pub p2_decision: Phase2Decision,
    pub signed_p2_decision: Option<SignedMessage>,
}

/// Final durable decision with proof. Exactly one evidence field must match
/// the decision under the configured validation flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Writeback {
    pub decision: CommitDecision,
    pub txn_digest: Digest,
    pub p1_sigs: Option<GroupedSignatures>,
    pub p2_sigs: Option<Vec<SignedMessage>>,
    pub conflict: Option<CommittedProof>,
}

/// Client-local abort: releases the read-timestamp intents of the read set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbortIntent {
    pub ts: Timestamp,
    pub read_set: Vec<Vec<u8>>,
}

/// Abort message; signed form required when signatures are enforced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Abort {
    pub internal: Option<AbortIntent>,
    pub signed_internal: Option<SignedMessage>,
}

/// Fallback Phase-1: any interested party asks for this replica's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase1Fb {
    pub req_id: ReqId,
    pub txn: Transaction,
}

/// A replica's current view for a digest; the signable part of AttachedView.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentView {
    pub txn_digest: Digest,
    pub view: u64,
    pub replica_id: ProcessId,
}

/// Current view plus its signature envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachedView {
    pub current_view: CurrentView,
    pub signed_current_view: Option<SignedMessage>,
}

/// Reply to `Phase1Fb`: whatever progress the replica has, by case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase1FbReply {
    pub req_id: ReqId,
    pub txn_digest: Digest,
    pub wb: Option<Writeback>,
    pub p1r: Option<Phase1Reply>,
    pub p2r: Option<Phase2Reply>,
    pub attached_view: AttachedView,
}

/// Fallback Phase-2: establish a decision on a replica that has none, either
/// from f+1 signed Phase-2 replies or from a grouped Phase-1 quorum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase2Fb {
    pub req_id: ReqId,
    pub txn_digest: Digest,
    pub txn: Option<Transaction>,
    pub decision: CommitDecision,
    pub p2_replies: Vec<Phase2Reply>,
    pub grouped_sigs: Option<GroupedSignatures>,
}

/// Reply to `Phase2Fb` and to `DecisionFb` distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase2FbReply {
    pub txn_digest: Digest,
    pub p2r: Phase2Reply,
    pub attached_view: AttachedView,
}

/// Propose a new fallback view. `view_sigs` carry signed `CurrentView`s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokeFb {
    pub req_id: ReqId,
    pub txn_digest: Digest,
    pub proposed_view: u64,
    pub catchup: bool,
    pub view_sigs: Vec<SignedMessage>,
    pub p2fb: Option<Phase2Fb>,
}

/// A replica's vote for the elected fallback coordinator of a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectMessage {
    pub req_id: ReqId,
    pub txn_digest: Digest,
    pub decision: CommitDecision,
    pub view: u64,
}

/// Elect vote envelope sent to the coordinator. The envelope's `data` is the
/// canonical `ElectMessage` encoding so votes can be counted and forwarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectFb {
    pub signed_elect: SignedMessage,
}

/// Coordinator's decision for a view, justified by the collected elect votes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionFb {
    pub req_id: ReqId,
    pub txn_digest: Digest,
    pub decision: CommitDecision,
    pub view: u64,
    pub elect_sigs: Vec<SignedMessage>,
}

/// A blocking in-flight transaction relayed to a requester so it can drive a
/// fallback for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayP1 {
    pub conflict_id: ReqId,
    pub p1: Phase1,
}

/// The full message family, dispatched by a single match in the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Read(Read),
    ReadReply(ReadReply),
    Phase1(Phase1),
    Phase1Reply(Phase1Reply),
    Phase2(Phase2),
    Phase2Reply(Phase2Reply),
    Writeback(Writeback),
    Abort(Abort),
    Phase1Fb(Phase1Fb),
    Phase1FbReply(Phase1FbReply),
    Phase2Fb(Phase2Fb),
    Phase2FbReply(Phase2FbReply),
    InvokeFb(InvokeFb),
    ElectFb(ElectFb),
    DecisionFb(DecisionFb),
    RelayP1(RelayP1),
}

/// Concurrency-control flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OccType {
    /// Strict OCC with internal retry timestamps.
    Tapir,
    /// Multi-version timestamp ordering.
    Mvtso,
}

/// Protocol parameters. These are the complete set of behavior switches; the
/// replica never consults anything else.
#[derive(Clone, Debug)]
pub struct Params {
    pub occ_type: OccType,
    /// Require/produce signatures on all protocol messages.
    pub signed_messages: bool,
    /// Enforce committed-proof validation on reads, Phase-2, and Writeback.
    pub validate_proofs: bool,
    /// Require a signature quorum on prepared-dependency witnesses.
    pub verify_deps: bool,
    /// Truncate transaction digests to half length.
    pub hash_digest: bool,
    /// Minimum signatures per dependency witness.
    pub read_dep_size: usize,
    /// Cap for piggybacked prepared-dep depth: -2 disables, -1 is unlimited.
    pub max_dep_depth: i64,
    /// High-watermark slack added to the local clock.
    pub time_delta: u64,
    /// Milliseconds the original client is entitled to before fallback.
    pub client_timeout_ms: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            occ_type: OccType::Mvtso,
            signed_messages: true,
            validate_proofs: true,
            verify_deps: true,
            hash_digest: false,
            read_dep_size: 1,
            max_dep_depth: -1,
            time_delta: 100,
            client_timeout_ms: 4_000,
        }
    }
}

/// Shard-group shape and the quorum thresholds derived from it.
#[derive(Clone, Copy, Debug)]
pub struct GroupConfig {
    /// Replicas per group.
    pub n: usize,
    /// Tolerated Byzantine failures per group.
    pub f: usize,
    /// Number of shard groups in the deployment.
    pub num_groups: usize,
}

impl GroupConfig {
    /// Fast-path Phase-1 quorum per group. 5f+1 when the group is large
    /// enough, unanimous otherwise.
    pub fn fast_quorum(&self) -> usize {
        self.n.min(5 * self.f + 1)
    }

    /// Slow-path Phase-1 commit quorum per group.
    pub fn slow_quorum(&self) -> usize {
        3 * self.f + 1
    }

    /// Non-commit votes in a single group that evidence an abort.
    pub fn abort_quorum(&self) -> usize {
        self.f + 1
    }

    /// Phase-2 reply quorum from the logging shard.
    pub fn p2_quorum(&self) -> usize {
        4 * self.f + 1
    }

    /// Elect votes the coordinator collects before deciding.
    pub fn elect_quorum(&self) -> usize {
        self.n - self.f
    }

    /// Commit votes within the elect quorum required to decide COMMIT.
    pub fn elect_commit_votes(&self) -> usize {
        2 * self.f + 1
    }

    /// Matching elect signatures a replica verifies inside a DecisionFb.
    pub fn decision_sigs(&self) -> usize {
        2 * self.f + 1
    }

    /// Distinct signed Phase-2 replies that let a fallback install a
    /// decision.
    pub fn p2fb_quorum(&self) -> usize {
        self.f + 1
    }

    /// Signed current views required to catch a replica up to a view.
    pub fn view_catchup_sigs(&self) -> usize {
        self.f + 1
    }

    /// Signed current views required to advance past a view.
    pub fn view_change_sigs(&self) -> usize {
        3 * self.f + 1
    }

    pub fn process_id(&self, group: GroupId, replica: usize) -> ProcessId {
        group * self.n as u64 + replica as u64
    }

    /// Whether `id` names a replica of `group`.
    pub fn in_group(&self, id: ProcessId, group: GroupId) -> bool {
        id / self.n as u64 == group
    }
}

/// A deferred event: the message is re-delivered to the local replica as if
/// `from` had sent it again after the delay.
#[derive(Clone, Debug)]
pub struct TimerEvent {
    pub from: Address,
    pub msg: Message,
}

/// Transport capabilities required by the replica. All sends are best-effort
/// datagrams; `timer` re-enqueues an event on the replica's own loop.
pub trait Transport: Send + Sync {
    fn send(&self, to: Address, msg: Message);
    fn send_replica(&self, group: GroupId, replica: usize, msg: Message);
    fn send_group(&self, group: GroupId, msg: Message);
    fn timer(&self, delay_ms: u64, event: TimerEvent);
}

/// Signing and verification keyed by process id.
pub trait KeyManager: Send + Sync {
    fn sign(&self, id: ProcessId, data: &[u8]) -> Option<Vec<u8>>;
    fn verify(&self, id: ProcessId, data: &[u8], signature: &[u8]) -> bool;
}

/// Maps keys to shard groups. Stable for a transaction's lifetime.
pub trait Partitioner: Send + Sync {
    fn group_for(&self, key: &[u8], num_groups: usize) -> GroupId;
}

/// Clock source: logical time for timestamps and wall milliseconds for the
/// fallback timeout gates.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u64;
    fn now_ms(&self) -> u64;
}

/// Key manager deriving deterministic Ed25519 keys from a cluster seed.
pub struct SeedKeyManager {
    keys: Vec<SigningKey>,
}

impl SeedKeyManager {
    /// Derive keys for process ids `0..num_processes`.
    pub fn new(num_processes: usize, seed: &[u8]) -> Self {
        let mut keys = Vec::with_capacity(num_processes);
        for id in 0..num_processes as u64 {
            let mut hasher = blake3::Hasher::new();
            hasher.update(seed);
            hasher.update(&id.to_be_bytes());
            let bytes: [u8; 32] = *hasher.finalize().as_bytes();
            keys.push(SigningKey::from_bytes(&bytes));
        }
        Self { keys }
    }

    pub fn verifying_key(&self, id: ProcessId) -> Option<VerifyingKey> {
        self.keys.get(id as usize).map(SigningKey::verifying_key)
    }
}

impl KeyManager for SeedKeyManager {
    fn sign(&self, id: ProcessId, data: &[u8]) -> Option<Vec<u8>> {
        let key = self.keys.get(id as usize)?;
        Some(key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, id: ProcessId, data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.keys.get(id as usize) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verifying_key().verify(data, &sig).is_ok()
    }
}

/// Partitioner routing keys to groups by hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn group_for(&self, key: &[u8], num_groups: usize) -> GroupId {
        if num_groups <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() % num_groups as u64
    }
}

/// Wall-clock time source; logical time is microseconds since the epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros()
            .min(u128::from(u64::MAX)) as u64
    }

    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .min(u128::from(u64::MAX)) as u64
    }
}
