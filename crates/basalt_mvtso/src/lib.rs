//! MVTSO replica engine crate.
//!
//! This crate provides the Byzantine-fault-tolerant replica engine used by
//! basalt_store. The API surface is intentionally small: higher layers supply
//! a `Transport`, `KeyManager`, `Partitioner`, and `TimeSource`, then feed
//! messages into a `Replica`.

pub mod engine;
