//! Cluster layout and protocol parameters loaded by the node binary.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use basalt_mvtso::engine::{GroupConfig, OccType, Params};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Tolerated Byzantine failures per group.
    pub f: usize,
    /// Seed for deterministic per-process keys. Test deployments only; a
    /// production deployment would plug in a real key manager.
    pub key_seed: String,
    /// Extra key slots beyond the replicas, one per client process id.
    #[serde(default = "default_client_processes")]
    pub client_processes: usize,
    /// Replica addresses, `groups[group][replica]`.
    pub groups: Vec<Vec<SocketAddr>>,
    #[serde(default)]
    pub params: ParamsConfig,
}

fn default_client_processes() -> usize {
    16
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ParamsConfig {
    pub occ_type: String,
    pub signed_messages: bool,
    pub validate_proofs: bool,
    pub verify_deps: bool,
    pub hash_digest: bool,
    pub read_dep_size: usize,
    pub max_dep_depth: i64,
    pub time_delta: u64,
    pub client_timeout_ms: u64,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        let params = Params::default();
        Self {
            occ_type: "mvtso".to_string(),
            signed_messages: params.signed_messages,
            validate_proofs: params.validate_proofs,
            verify_deps: params.verify_deps,
            hash_digest: params.hash_digest,
            read_dep_size: params.read_dep_size,
            max_dep_depth: params.max_dep_depth,
            time_delta: params.time_delta,
            client_timeout_ms: params.client_timeout_ms,
        }
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading cluster config {}", path.display()))?;
        let config: ClusterConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing cluster config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.groups.is_empty(), "cluster config has no groups");
        let n = self.groups[0].len();
        anyhow::ensure!(n > 0, "group 0 has no replicas");
        for (idx, group) in self.groups.iter().enumerate() {
            anyhow::ensure!(
                group.len() == n,
                "group {idx} has {} replicas, expected {n}",
                group.len()
            );
        }
        anyhow::ensure!(
            n >= 3 * self.f + 1,
            "n = {n} is below the safety floor 3f+1 for f = {}",
            self.f
        );
        Ok(())
    }

    pub fn group_config(&self) -> GroupConfig {
        GroupConfig {
            n: self.groups[0].len(),
            f: self.f,
            num_groups: self.groups.len(),
        }
    }

    /// Total process-id space: every replica plus the client slots.
    pub fn num_processes(&self) -> usize {
        self.groups.len() * self.groups[0].len() + self.client_processes
    }

    pub fn to_params(&self) -> anyhow::Result<Params> {
        let occ_type = match self.params.occ_type.as_str() {
            "mvtso" => OccType::Mvtso,
            "tapir" => OccType::Tapir,
            other => anyhow::bail!("unknown occ type {other:?} (expected mvtso or tapir)"),
        };
        Ok(Params {
            occ_type,
            signed_messages: self.params.signed_messages,
            validate_proofs: self.params.validate_proofs,
            verify_deps: self.params.verify_deps,
            hash_digest: self.params.hash_digest,
            read_dep_size: self.params.read_dep_size,
            max_dep_depth: self.params.max_dep_depth,
            time_delta: self.params.time_delta,
            client_timeout_ms: self.params.client_timeout_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let raw = r#"{
            "f": 1,
            "key_seed": "basalt-dev",
            "groups": [[
                "127.0.0.1:7101", "127.0.0.1:7102", "127.0.0.1:7103",
                "127.0.0.1:7104", "127.0.0.1:7105"
            ]],
            "params": { "occ_type": "mvtso" }
        }"#;
        let config: ClusterConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.group_config().n, 5);
        assert_eq!(config.to_params().unwrap().read_dep_size, 1);
    }

    #[test]
    fn rejects_groups_below_the_safety_floor() {
        let raw = r#"{
            "f": 1,
            "key_seed": "basalt-dev",
            "groups": [["127.0.0.1:7101", "127.0.0.1:7102", "127.0.0.1:7103"]]
        }"#;
        let config: ClusterConfig = serde_json::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
