//! DML dispatch benchmark harness.
//!
//! Builds an in-memory sharded cluster from `ddal.toml` (or from the command
//! line when the file has no `[cluster]` section), then runs a multi-row
//! INSERT, a point UPDATE, a broadcast UPDATE and a DELETE against the
//! `orders` table, printing affected rows, timings and dispatch stats.
//!
//! Usage:
//!   cargo run -p ddal_bench -- --rows 10000 --shards 4
//!   cargo run -p ddal_bench -- --config ddal.toml --timeout-ms 500

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use ddal_cluster::repo::MemoryCluster;
use ddal_cluster::routing::RuleRouter;
use ddal_common::config::{ClusterConfig, DdalConfig, NodeConfig, ShardPolicyConfig, TableRuleConfig};
use ddal_common::datum::Datum;
use ddal_common::schema::{Catalog, ColumnDef};
use ddal_common::types::{ColumnId, DataType};
use ddal_executor::context::ExecutionContext;
use ddal_executor::executor_delete::DeleteExecutor;
use ddal_executor::executor_insert::InsertExecutor;
use ddal_executor::executor_update::UpdateExecutor;
use ddal_executor::expression::Expression;
use ddal_executor::framework::{DmlExecutor, WritePipeline};
use ddal_executor::prepared::{Delete, Insert, Update};
use ddal_executor::worker::ShardWorkerFactory;

#[derive(Parser, Debug)]
#[command(name = "ddal-bench", about = "Sharded DML dispatch benchmark")]
struct Args {
    /// Configuration file.
    #[arg(long, default_value = "ddal.toml")]
    config: PathBuf,

    /// Rows inserted by the INSERT phase.
    #[arg(long, default_value_t = 10_000)]
    rows: i64,

    /// Shards used when the config has no `[cluster]` section.
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Override `executor.statement_timeout_ms`.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Override `executor.flush_threshold`.
    #[arg(long)]
    flush_threshold: Option<usize>,

    /// Print the routed INSERT plan for the first rows and exit.
    #[arg(long, default_value_t = false)]
    explain: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ddal=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

const ID: ColumnId = ColumnId(0);
const STATUS: ColumnId = ColumnId(3);

fn bench_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.create_table(
        "orders",
        vec![
            ColumnDef::new(0, "id", DataType::Int64).not_null(),
            ColumnDef::new(1, "customer", DataType::Text),
            ColumnDef::new(2, "amount", DataType::Decimal(12, 2)),
            ColumnDef::new(3, "status", DataType::Text).with_default(Datum::Text("new".into())),
        ],
    );
    catalog
}

fn default_cluster(shards: usize) -> ClusterConfig {
    let names: Vec<String> = (0..shards.max(1)).map(|i| format!("shard_{}", i)).collect();
    ClusterConfig {
        tables: vec![TableRuleConfig {
            name: "orders".into(),
            shard_key: vec!["id".into()],
            policy: ShardPolicyConfig::Hash,
            nodes: names
                .iter()
                .enumerate()
                .map(|(i, s)| NodeConfig {
                    shard: s.clone(),
                    table: format!("orders_{}", i),
                })
                .collect(),
        }],
        shards: names,
    }
}

fn insert_statement(rows: i64) -> Insert {
    let mut insert = Insert::new("orders", vec![ColumnId(0), ColumnId(1), ColumnId(2)]);
    for id in 0..rows {
        insert = insert.values(vec![
            Some(Expression::literal(id)),
            Some(Expression::Parameter(1)),
            Some(Expression::literal(format!("{}.{:02}", id % 1000, id % 100).as_str())),
        ]);
    }
    insert.bind(vec![Datum::Text("bench".into())])
}

fn run_phase(name: &str, executor: &mut dyn DmlExecutor) -> anyhow::Result<u64> {
    let start = Instant::now();
    let affected = executor.update().with_context(|| format!("{} {} failed", executor.kind(), name))?;
    let elapsed = start.elapsed();
    let label = format!("{} {}", executor.kind(), name);
    println!("{:<22} affected={:<8} elapsed={:?}", label, affected, elapsed);
    Ok(affected)
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = DdalConfig::load_or_default(&args.config);
    if let Some(ms) = args.timeout_ms {
        config.executor.statement_timeout_ms = ms;
    }
    if let Some(n) = args.flush_threshold {
        config.executor.flush_threshold = n;
    }
    if config.cluster.tables.is_empty() {
        config.cluster = default_cluster(args.shards);
    }
    config.validate().context("invalid configuration")?;

    let catalog = Arc::new(bench_catalog());
    let cluster = MemoryCluster::from_config(&config.cluster, catalog.as_ref())?;
    let router = Arc::new(RuleRouter::from_config(&config.cluster, catalog.as_ref())?);
    let factory = Arc::new(ShardWorkerFactory::new(Arc::new(cluster.clone())));
    let ctx = Arc::new(ExecutionContext::new(&config.executor));
    let pipeline = || WritePipeline::new(router.clone(), factory.clone(), Arc::clone(&ctx));

    tracing::info!(
        shards = cluster.shard_count(),
        rows = args.rows,
        flush_threshold = config.executor.flush_threshold,
        timeout_ms = config.executor.statement_timeout_ms,
        "starting bench"
    );

    if args.explain {
        let mut insert = InsertExecutor::new(insert_statement(args.rows.min(20)), catalog.clone(), pipeline());
        println!("{}", insert.explain()?);
        return Ok(());
    }

    let mut insert = InsertExecutor::new(insert_statement(args.rows), catalog.clone(), pipeline());
    let inserted = run_phase("(multi-row)", &mut insert)?;

    let point = Update::new("orders")
        .set(STATUS, Expression::literal("shipped"))
        .filter(ID, Expression::Parameter(1))
        .bind(vec![Datum::Int64(args.rows / 2)]);
    let mut point = UpdateExecutor::new(point, catalog.clone(), pipeline());
    run_phase("(point)", &mut point)?;

    let broadcast = Update::new("orders")
        .set(STATUS, Expression::literal("closed"))
        .filter(STATUS, Expression::literal("new"));
    let mut broadcast = UpdateExecutor::new(broadcast, catalog.clone(), pipeline());
    run_phase("(broadcast)", &mut broadcast)?;

    let mut delete = DeleteExecutor::new(Delete::new("orders"), catalog.clone(), pipeline());
    let deleted = run_phase("(all)", &mut delete)?;
    if deleted != inserted {
        anyhow::bail!("deleted {} rows but inserted {}", deleted, inserted);
    }

    let stats = ctx.stats().snapshot();
    println!();
    println!("flushes            {}", stats.flushes);
    println!("single-row flushes {}", stats.single_row_flushes);
    println!("inline dispatches  {}", stats.inline_dispatches);
    println!("pooled dispatches  {}", stats.pooled_dispatches);
    println!("batch merges       {}", stats.batch_merges);
    println!("workers executed   {}", stats.workers_executed);
    println!("worker failures    {}", stats.worker_failures);
    println!("timeouts           {}", stats.timeouts);
    let pool = ctx.pool();
    println!(
        "pool jobs          completed={} panicked={} queued={}",
        pool.completed_jobs(),
        pool.panicked_jobs(),
        pool.queued()
    );
    println!("round trips        {}", cluster.round_trips());
    println!(
        "connections        opened={} closed={}",
        cluster.connections_opened(),
        cluster.connections_closed()
    );
    Ok(())
}
