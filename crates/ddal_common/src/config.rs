use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DdalError, DdalResult};

/// Top-level configuration of the execution layer (ddal.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DdalConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Statement execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Statement timeout in milliseconds (0 = no timeout).
    pub statement_timeout_ms: u64,
    /// Buffered rows per flush.
    pub flush_threshold: usize,
    /// Pending workers above this count are merged by batch key.
    pub batch_merge_threshold: usize,
    /// Threads in the shared execution pool.
    pub pool_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 0,
            flush_threshold: 500,
            batch_merge_threshold: 5,
            pool_threads: default_pool_threads(),
        }
    }
}

fn default_pool_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(2)
}

/// Shard topology and per-table sharding rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub shards: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableRuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardPolicyConfig {
    #[default]
    Hash,
    Reference,
    Single,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRuleConfig {
    pub name: String,
    #[serde(default)]
    pub shard_key: Vec<String>,
    #[serde(default)]
    pub policy: ShardPolicyConfig,
    pub nodes: Vec<NodeConfig>,
}

/// One physical placement: a shard and the physical table name on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub shard: String,
    pub table: String,
}

impl DdalConfig {
    /// Parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> DdalResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DdalError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> DdalResult<Self> {
        let config: DdalConfig =
            toml::from_str(content).map_err(|e| DdalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> DdalResult<()> {
        if self.executor.flush_threshold == 0 {
            return Err(DdalError::Config("executor.flush_threshold must be > 0".into()));
        }
        if self.executor.pool_threads == 0 {
            return Err(DdalError::Config("executor.pool_threads must be > 0".into()));
        }
        for table in &self.cluster.tables {
            if table.nodes.is_empty() {
                return Err(DdalError::Config(format!("table {} has no nodes", table.name)));
            }
            if table.policy == ShardPolicyConfig::Hash && table.shard_key.is_empty() {
                return Err(DdalError::Config(format!(
                    "hash-sharded table {} needs a shard_key",
                    table.name
                )));
            }
            if let Some(node) = table
                .nodes
                .iter()
                .find(|n| !self.cluster.shards.is_empty() && !self.cluster.shards.contains(&n.shard))
            {
                return Err(DdalError::Config(format!(
                    "table {} references unknown shard {}",
                    table.name, node.shard
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[executor]
statement_timeout_ms = 250
flush_threshold = 100

[cluster]
shards = ["s0", "s1"]

[[cluster.tables]]
name = "orders"
shard_key = ["id"]
nodes = [
    { shard = "s0", table = "orders_0" },
    { shard = "s1", table = "orders_1" },
]

[[cluster.tables]]
name = "regions"
policy = "reference"
nodes = [
    { shard = "s0", table = "regions" },
    { shard = "s1", table = "regions" },
]
"#;

    #[test]
    fn test_defaults() {
        let config = DdalConfig::default();
        assert_eq!(config.executor.statement_timeout_ms, 0);
        assert_eq!(config.executor.flush_threshold, 500);
        assert_eq!(config.executor.batch_merge_threshold, 5);
        assert!(config.executor.pool_threads >= 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config = DdalConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.executor.statement_timeout_ms, 250);
        assert_eq!(config.executor.flush_threshold, 100);
        // unspecified keys keep their defaults
        assert_eq!(config.executor.batch_merge_threshold, 5);
        assert_eq!(config.cluster.tables.len(), 2);
        assert_eq!(config.cluster.tables[0].policy, ShardPolicyConfig::Hash);
        assert_eq!(config.cluster.tables[1].policy, ShardPolicyConfig::Reference);
        assert_eq!(config.cluster.tables[0].nodes[1].table, "orders_1");
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let err = DdalConfig::from_toml("[executor]\nflush_threshold = 0\n").unwrap_err();
        assert!(err.to_string().contains("flush_threshold"));
        let err = DdalConfig::from_toml("[executor]\npool_threads = 0\n").unwrap_err();
        assert!(err.to_string().contains("pool_threads"));
    }

    #[test]
    fn test_validate_rejects_unknown_shard() {
        let toml = r#"
[cluster]
shards = ["s0"]
[[cluster.tables]]
name = "t"
shard_key = ["id"]
nodes = [{ shard = "s9", table = "t_9" }]
"#;
        let err = DdalConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("unknown shard s9"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DdalConfig::load(file.path()).unwrap();
        assert_eq!(config.cluster.shards, vec!["s0", "s1"]);
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = DdalConfig::load_or_default(&missing);
        assert_eq!(config.executor.flush_threshold, 500);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[executor]\nflush_threshold = \"lots\"\n").unwrap();
        let config = DdalConfig::load_or_default(&bad);
        assert_eq!(config.executor.flush_threshold, 500);
    }
}
