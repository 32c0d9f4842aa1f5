//! Row routing: resolves sharding rules into the physical nodes a row or a
//! predicate must reach.

use std::collections::HashMap;
use std::fmt;

use ddal_common::config::{ClusterConfig, ShardPolicyConfig};
use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::{DdalResult, MetadataError, RoutingError};
use ddal_common::schema::TableMetaProvider;
use ddal_common::types::ColumnId;

use crate::sharding::{compute_shard_hash, compute_shard_hash_from_datums, slot_for_hash};

/// A physical target: shard identifier + physical table name on that shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectNode {
    pub shard: String,
    pub object: String,
}

impl ObjectNode {
    pub fn new(shard: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            object: object.into(),
        }
    }
}

impl fmt::Display for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.shard, self.object)
    }
}

/// Ordered, duplicate-free set of target nodes. Empty is a valid result:
/// the statement matches no shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingResult {
    nodes: Vec<ObjectNode>,
}

impl RoutingResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(node: ObjectNode) -> Self {
        Self { nodes: vec![node] }
    }

    pub fn add(&mut self, node: ObjectNode) {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    pub fn nodes(&self) -> &[ObjectNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_single_node(&self) -> bool {
        self.nodes.len() == 1
    }
}

impl FromIterator<ObjectNode> for RoutingResult {
    fn from_iter<I: IntoIterator<Item = ObjectNode>>(iter: I) -> Self {
        let mut result = RoutingResult::empty();
        for node in iter {
            result.add(node);
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPolicy {
    /// Hash of the shard key columns modulo the node count.
    Hash,
    /// Replicated on every node.
    Reference,
    /// Lives on exactly one node.
    Single,
}

impl From<ShardPolicyConfig> for ShardPolicy {
    fn from(p: ShardPolicyConfig) -> Self {
        match p {
            ShardPolicyConfig::Hash => ShardPolicy::Hash,
            ShardPolicyConfig::Reference => ShardPolicy::Reference,
            ShardPolicyConfig::Single => ShardPolicy::Single,
        }
    }
}

/// Sharding rule of one logical table.
#[derive(Debug, Clone)]
pub struct TableRule {
    pub table: String,
    pub shard_key: Vec<ColumnId>,
    /// Column names parallel to `shard_key`, for diagnostics.
    pub key_names: Vec<String>,
    pub policy: ShardPolicy,
    pub nodes: Vec<ObjectNode>,
}

impl TableRule {
    pub fn hash(table: &str, shard_key: Vec<(ColumnId, String)>, nodes: Vec<ObjectNode>) -> Self {
        let (shard_key, key_names) = shard_key.into_iter().unzip();
        Self {
            table: table.to_string(),
            shard_key,
            key_names,
            policy: ShardPolicy::Hash,
            nodes,
        }
    }

    pub fn reference(table: &str, nodes: Vec<ObjectNode>) -> Self {
        Self {
            table: table.to_string(),
            shard_key: Vec::new(),
            key_names: Vec::new(),
            policy: ShardPolicy::Reference,
            nodes,
        }
    }

    pub fn single(table: &str, node: ObjectNode) -> Self {
        Self {
            table: table.to_string(),
            shard_key: Vec::new(),
            key_names: Vec::new(),
            policy: ShardPolicy::Single,
            nodes: vec![node],
        }
    }

    pub fn is_shard_key(&self, col: ColumnId) -> bool {
        self.policy == ShardPolicy::Hash && self.shard_key.contains(&col)
    }

    fn all_nodes(&self) -> RoutingResult {
        self.nodes.iter().cloned().collect()
    }

    fn check_nodes(&self) -> Result<(), RoutingError> {
        if self.nodes.is_empty() {
            return Err(RoutingError::NoNodes {
                table: self.table.clone(),
            });
        }
        Ok(())
    }
}

/// The sharding rule evaluator seam.
pub trait RoutingHandler: Send + Sync {
    fn rule(&self, table: &str) -> Result<&TableRule, RoutingError>;

    /// Nodes that must receive `row` (INSERT).
    fn route_row(&self, table: &str, row: &OwnedRow) -> Result<RoutingResult, RoutingError>;

    /// Nodes that may hold rows matching a conjunction of `column = value`
    /// predicates (UPDATE / DELETE). An empty condition reaches every node.
    fn route_condition(
        &self,
        table: &str,
        condition: &[(ColumnId, Datum)],
    ) -> Result<RoutingResult, RoutingError>;

    /// Reject assignments to sharding columns.
    fn check_update(&self, table: &str, assigned: &[ColumnId]) -> Result<(), RoutingError> {
        let rule = self.rule(table)?;
        match assigned.iter().find(|col| rule.is_shard_key(**col)) {
            Some(col) => {
                let pos = rule.shard_key.iter().position(|k| k == col);
                Err(RoutingError::ShardKeyUpdate {
                    table: rule.table.clone(),
                    column: pos
                        .and_then(|p| rule.key_names.get(p))
                        .cloned()
                        .unwrap_or_else(|| col.to_string()),
                })
            }
            None => Ok(()),
        }
    }
}

/// Rule-set router keyed by lowercase logical table name.
#[derive(Debug, Default)]
pub struct RuleRouter {
    rules: HashMap<String, TableRule>,
}

impl RuleRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: TableRule) {
        self.rules.insert(rule.table.to_lowercase(), rule);
    }

    pub fn with_rule(mut self, rule: TableRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Build rules from the `[cluster]` section, resolving shard key names
    /// against the catalog.
    pub fn from_config(config: &ClusterConfig, meta: &dyn TableMetaProvider) -> DdalResult<Self> {
        let mut router = RuleRouter::new();
        for table in &config.tables {
            let schema = meta.table(&table.name)?;
            let nodes: Vec<ObjectNode> = table
                .nodes
                .iter()
                .map(|n| ObjectNode::new(&n.shard, &n.table))
                .collect();
            let rule = match ShardPolicy::from(table.policy) {
                ShardPolicy::Hash => {
                    let ids = schema.resolve_columns(&table.shard_key[..])?;
                    let key = ids
                        .into_iter()
                        .map(|id| {
                            schema
                                .column(id)
                                .map(|c| (id, c.name.clone()))
                                .ok_or_else(|| MetadataError::UnknownColumn {
                                    table: schema.name.clone(),
                                    column: id.to_string(),
                                })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    TableRule::hash(&schema.name, key, nodes)
                }
                ShardPolicy::Reference => TableRule::reference(&schema.name, nodes),
                ShardPolicy::Single => {
                    let mut rule = TableRule::reference(&schema.name, nodes);
                    rule.policy = ShardPolicy::Single;
                    rule.nodes.truncate(1);
                    rule
                }
            };
            tracing::debug!(
                table = %rule.table,
                policy = ?rule.policy,
                nodes = rule.nodes.len(),
                "registered sharding rule"
            );
            router.add_rule(rule);
        }
        tracing::info!(rules = router.rule_count(), "routing rules loaded");
        Ok(router)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl RoutingHandler for RuleRouter {
    fn rule(&self, table: &str) -> Result<&TableRule, RoutingError> {
        self.rules
            .get(&table.to_lowercase())
            .ok_or_else(|| RoutingError::NoRule(table.to_string()))
    }

    fn route_row(&self, table: &str, row: &OwnedRow) -> Result<RoutingResult, RoutingError> {
        let rule = self.rule(table)?;
        rule.check_nodes()?;
        match rule.policy {
            ShardPolicy::Reference => Ok(rule.all_nodes()),
            ShardPolicy::Single => Ok(RoutingResult::single(rule.nodes[0].clone())),
            ShardPolicy::Hash => {
                for (pos, col) in rule.shard_key.iter().enumerate() {
                    if row.get(col.index()).map_or(true, Datum::is_null) {
                        return Err(RoutingError::MissingShardKey {
                            table: rule.table.clone(),
                            column: rule.key_names.get(pos).cloned().unwrap_or_else(|| col.to_string()),
                            row: row.to_string(),
                        });
                    }
                }
                let hash = compute_shard_hash(row, &rule.shard_key);
                let node = &rule.nodes[slot_for_hash(hash, rule.nodes.len())];
                Ok(RoutingResult::single(node.clone()))
            }
        }
    }

    fn route_condition(
        &self,
        table: &str,
        condition: &[(ColumnId, Datum)],
    ) -> Result<RoutingResult, RoutingError> {
        let rule = self.rule(table)?;
        rule.check_nodes()?;
        match rule.policy {
            ShardPolicy::Reference => Ok(rule.all_nodes()),
            ShardPolicy::Single => Ok(RoutingResult::single(rule.nodes[0].clone())),
            ShardPolicy::Hash => {
                let mut key_values = Vec::with_capacity(rule.shard_key.len());
                for col in &rule.shard_key {
                    match condition.iter().find(|(c, _)| c == col) {
                        Some((_, v)) => key_values.push(v),
                        None => return Ok(rule.all_nodes()),
                    }
                }
                // `key = NULL` never matches under SQL semantics.
                if key_values.iter().any(|v| v.is_null()) {
                    return Ok(RoutingResult::empty());
                }
                let hash = compute_shard_hash_from_datums(&key_values);
                let node = &rule.nodes[slot_for_hash(hash, rule.nodes.len())];
                Ok(RoutingResult::single(node.clone()))
            }
        }
    }
}
