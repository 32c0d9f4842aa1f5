//! Shared fixture: an `orders` table hash-sharded over N in-memory shards,
//! an `events` table sharded on a nullable `tenant` column, and a `regions`
//! reference table.

#![allow(dead_code)]

use std::sync::Arc;

use ddal_cluster::repo::MemoryCluster;
use ddal_cluster::routing::RuleRouter;
use ddal_common::config::{
    ClusterConfig, ExecutorConfig, NodeConfig, ShardPolicyConfig, TableRuleConfig,
};
use ddal_common::datum::Datum;
use ddal_common::schema::{Catalog, ColumnDef};
use ddal_common::types::{ColumnId, DataType};
use ddal_executor::context::{ExecutionContext, PoolHandle};
use ddal_executor::expression::Expression;
use ddal_executor::framework::WritePipeline;
use ddal_executor::pool::ExecutionPool;
use ddal_executor::worker::ShardWorkerFactory;

pub const ID: ColumnId = ColumnId(0);
pub const CUSTOMER: ColumnId = ColumnId(1);
pub const AMOUNT: ColumnId = ColumnId(2);
pub const STATUS: ColumnId = ColumnId(3);

pub struct Fixture {
    pub catalog: Arc<Catalog>,
    pub cluster: MemoryCluster,
    pub router: Arc<RuleRouter>,
    pub factory: Arc<ShardWorkerFactory>,
    pub ctx: Arc<ExecutionContext>,
    pub shards: usize,
}

impl Fixture {
    pub fn new(shards: usize) -> Self {
        Self::with_config(shards, ExecutorConfig::default())
    }

    pub fn with_config(shards: usize, config: ExecutorConfig) -> Self {
        let mut catalog = Catalog::new();
        catalog.create_table(
            "orders",
            vec![
                ColumnDef::new(0, "id", DataType::Int64).not_null(),
                ColumnDef::new(1, "customer", DataType::Text),
                ColumnDef::new(2, "amount", DataType::Decimal(10, 2)),
                ColumnDef::new(3, "status", DataType::Text).with_default(Datum::Text("new".into())),
            ],
        );
        catalog.create_table(
            "events",
            vec![
                ColumnDef::new(0, "id", DataType::Int64).not_null(),
                ColumnDef::new(1, "tenant", DataType::Text),
                ColumnDef::new(2, "note", DataType::Text),
            ],
        );
        catalog.create_table(
            "regions",
            vec![
                ColumnDef::new(0, "code", DataType::Text).not_null(),
                ColumnDef::new(1, "name", DataType::Text),
            ],
        );

        let shard_names: Vec<String> = (0..shards).map(|i| format!("shard_{}", i)).collect();
        let cluster_config = ClusterConfig {
            shards: shard_names.clone(),
            tables: vec![
                TableRuleConfig {
                    name: "orders".into(),
                    shard_key: vec!["id".into()],
                    policy: ShardPolicyConfig::Hash,
                    nodes: shard_names
                        .iter()
                        .enumerate()
                        .map(|(i, s)| NodeConfig {
                            shard: s.clone(),
                            table: format!("orders_{}", i),
                        })
                        .collect(),
                },
                TableRuleConfig {
                    name: "events".into(),
                    shard_key: vec!["tenant".into()],
                    policy: ShardPolicyConfig::Hash,
                    nodes: shard_names
                        .iter()
                        .enumerate()
                        .map(|(i, s)| NodeConfig {
                            shard: s.clone(),
                            table: format!("events_{}", i),
                        })
                        .collect(),
                },
                TableRuleConfig {
                    name: "regions".into(),
                    shard_key: Vec::new(),
                    policy: ShardPolicyConfig::Reference,
                    nodes: shard_names
                        .iter()
                        .map(|s| NodeConfig {
                            shard: s.clone(),
                            table: "regions".into(),
                        })
                        .collect(),
                },
            ],
        };

        let cluster = MemoryCluster::from_config(&cluster_config, &catalog).unwrap();
        let router = RuleRouter::from_config(&cluster_config, &catalog).unwrap();
        let threads = config.pool_threads.max(2);
        let ctx = ExecutionContext::with_pool(&config, Arc::new(PoolHandle::Owned(ExecutionPool::new(threads))));
        Self {
            catalog: Arc::new(catalog),
            factory: Arc::new(ShardWorkerFactory::new(Arc::new(cluster.clone()))),
            cluster,
            router: Arc::new(router),
            ctx: Arc::new(ctx),
            shards,
        }
    }

    pub fn pipeline(&self) -> WritePipeline {
        WritePipeline::new(self.router.clone(), self.factory.clone(), Arc::clone(&self.ctx))
    }

    pub fn shard(&self, i: usize) -> String {
        format!("shard_{}", i)
    }

    pub fn orders_on(&self, i: usize) -> Vec<Vec<Datum>> {
        self.cluster.rows(&self.shard(i), &format!("orders_{}", i))
    }

    pub fn total_orders(&self) -> usize {
        (0..self.shards)
            .map(|i| self.cluster.row_count(&self.shard(i), &format!("orders_{}", i)))
            .sum()
    }

    pub fn total_events(&self) -> usize {
        (0..self.shards)
            .map(|i| self.cluster.row_count(&self.shard(i), &format!("events_{}", i)))
            .sum()
    }

    /// Index of the shard holding order `id`, if any.
    pub fn shard_of(&self, id: i64) -> Option<usize> {
        (0..self.shards).find(|i| self.orders_on(*i).iter().any(|r| r[0] == Datum::Int64(id)))
    }

    /// Wait for pool threads to release connections of abandoned workers.
    pub fn wait_for_release(&self) {
        let start = std::time::Instant::now();
        while self.cluster.open_connections() > 0 && start.elapsed() < std::time::Duration::from_secs(10) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

/// `(id, 'c<id>', <id>.50)`
pub fn order_row(id: i64) -> Vec<Option<Expression>> {
    vec![
        Some(Expression::literal(id)),
        Some(Expression::literal(format!("c{}", id).as_str())),
        Some(Expression::literal(format!("{}.50", id).as_str())),
    ]
}

/// `(id, <tenant>, 'e<id>')`; `None` leaves the tenant NULL.
pub fn event_row(id: i64, tenant: Option<&str>) -> Vec<Option<Expression>> {
    vec![
        Some(Expression::literal(id)),
        Some(tenant.map_or(Expression::Literal(Datum::Null), |t| Expression::literal(t))),
        Some(Expression::literal(format!("e{}", id).as_str())),
    ]
}

pub fn event_columns() -> Vec<ColumnId> {
    vec![ColumnId(0), ColumnId(1), ColumnId(2)]
}

pub fn order_columns() -> Vec<ColumnId> {
    vec![ID, CUSTOMER, AMOUNT]
}
