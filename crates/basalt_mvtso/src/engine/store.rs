//! Versioned committed store.
//!
//! Each key maps to an ordered set of committed versions. Reads resolve to
//! the greatest version at or below the requested timestamp; misses are not
//! errors. The store also tracks the greatest committed read per key, which
//! the strict-OCC check consults.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use super::types::{Timestamp, Value};

#[derive(Default)]
pub struct VersionedStore {
    versions: HashMap<Vec<u8>, BTreeMap<Timestamp, Value>>,
    last_reads: HashMap<Vec<u8>, Timestamp>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed version. Committed versions are immutable and
    /// totally ordered; writing the same timestamp twice is a program error.
    pub fn put(&mut self, key: &[u8], value: Value, ts: Timestamp) {
        let prev = self
            .versions
            .entry(key.to_vec())
            .or_default()
            .insert(ts, value);
        assert!(prev.is_none(), "duplicate committed version at {ts:?}");
    }

    /// Greatest committed version at or below `ts`.
    pub fn get(&self, key: &[u8], ts: Timestamp) -> Option<(Timestamp, &Value)> {
        let versions = self.versions.get(key)?;
        versions
            .range(..=ts)
            .next_back()
            .map(|(version, value)| (*version, value))
    }

    /// Most recent committed version of `key`.
    pub fn get_latest(&self, key: &[u8]) -> Option<(Timestamp, &Value)> {
        let versions = self.versions.get(key)?;
        versions
            .iter()
            .next_back()
            .map(|(version, value)| (*version, value))
    }

    /// Greatest committed read timestamp observed against `key`.
    pub fn get_last_read(&self, key: &[u8]) -> Option<Timestamp> {
        self.last_reads.get(key).copied()
    }

    /// The committed window containing `read_ts`: the version serving the
    /// read and the next version above it, `None` when still current.
    pub fn get_range(&self, key: &[u8], read_ts: Timestamp) -> Option<(Timestamp, Option<Timestamp>)> {
        let versions = self.versions.get(key)?;
        let (low, _) = versions.range(..=read_ts).next_back()?;
        let high = versions
            .range((Bound::Excluded(read_ts), Bound::Unbounded))
            .next()
            .map(|(ts, _)| *ts);
        Some((*low, high))
    }

    /// All committed versions with timestamp strictly above `ts`.
    pub fn get_committed_after(&self, key: &[u8], ts: Timestamp) -> Vec<(Timestamp, &Value)> {
        let Some(versions) = self.versions.get(key) else {
            return Vec::new();
        };
        versions
            .range((Bound::Excluded(ts), Bound::Unbounded))
            .map(|(version, value)| (*version, value))
            .collect()
    }

    /// Record that a read at `read_ts` was subsumed by a transaction
    /// committing at `commit_ts`.
    pub fn commit_get(&mut self, key: &[u8], _read_ts: Timestamp, commit_ts: Timestamp) {
        let entry = self.last_reads.entry(key.to_vec()).or_insert(commit_ts);
        if commit_ts > *entry {
            *entry = commit_ts;
        }
    }
}
