//! Engine module wiring.
//!
//! `server` contains the replica and its message handlers, `state` holds the
//! in-memory indexes, `store` is the versioned committed store, `wire` defines
//! the canonical encodings and digests, `verify` implements signature-quorum
//! validation, and `types` defines the shared messages and trait contracts
//! (transport, key manager, partitioner, time source).

mod server;
mod state;
mod store;
mod types;
mod verify;
mod wire;

pub use server::{Replica, Stats};
pub use store::VersionedStore;
pub use types::{
    Abort, AbortIntent, Address, AttachedView, CcDecision, CcResult, CommitDecision,
    CommittedProof, CommittedValue, CurrentView, DecisionFb, Dependency, Digest, ElectFb,
    ElectMessage, GroupConfig, GroupId, GroupedSignatures, HashPartitioner, InvokeFb, KeyManager,
    Message, OccType, Params, Partitioner, Phase1, Phase1Fb, Phase1FbReply, Phase1Reply, Phase2,
    Phase2Decision, Phase2Fb, Phase2FbReply, Phase2Reply, PreparedValue, PreparedWrite, ProcessId,
    ProofQuorum, Read, ReadOp, ReadReply, RelayP1, ReqId, SeedKeyManager, SignedMessage,
    SystemTimeSource, TimeSource, TimerEvent, Timestamp, Transaction, Transport, Value,
    VisibleWrite, WriteOp, Writeback,
};
pub use verify::{
    transactions_conflict, validate_committed_conflict, validate_dependency, validate_p1_replies,
    validate_p2_replies, validate_proof, verify_signed,
};
pub use wire::{
    decode_message, encode_abort_intent, encode_cc_vote, encode_current_view,
    encode_elect_message, encode_message, encode_p2_decision, encode_visible_write, hex_prefix,
    transaction_digest,
};
