//! Shared write path of the DML executors.
//!
//! Each statement kind implements [`DmlExecutor`] and owns a
//! [`WritePipeline`], which turns one flush of logical rows into a
//! [`WorkerSet`], optionally merges it by batch key, dispatches it and folds
//! the outcomes. Flushes are full barriers: flush N is dispatched and folded
//! before flush N+1 is planned.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ddal_cluster::repo::ShardCommand;
use ddal_cluster::routing::{ObjectNode, RoutingHandler, RoutingResult};
use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::DdalResult;
use ddal_common::types::DmlKind;

use crate::aggregator::Aggregator;
use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::worker::{WorkerFactory, WorkerSet};

/// Hooks every DML statement kind provides.
pub trait DmlExecutor {
    fn kind(&self) -> DmlKind;

    /// Resolve metadata and validate the statement against the rule set.
    fn prepare(&mut self) -> DdalResult<()>;

    /// Execute and return the affected row count.
    fn update(&mut self) -> DdalResult<u64>;

    /// Shard statement and parameter row for `row` on `node`.
    fn translate(&self, node: &ObjectNode, row: &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)>;

    /// Routed plan without executing it.
    fn explain(&mut self) -> DdalResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Nothing routed.
    Empty,
    /// One worker, run on the calling thread.
    Single,
    /// Several workers, dispatched concurrently.
    Multiple,
    /// Workers merged by batch key before dispatch.
    Batch,
}

impl ExecutionStrategy {
    /// Strategy of a statement dispatched once to every routed node.
    pub fn for_route(route: &RoutingResult) -> Self {
        if route.is_empty() {
            ExecutionStrategy::Empty
        } else if route.is_single_node() {
            ExecutionStrategy::Single
        } else {
            ExecutionStrategy::Multiple
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStrategy::Empty => "EMPTY",
            ExecutionStrategy::Single => "SINGLE",
            ExecutionStrategy::Multiple => "MULTIPLE",
            ExecutionStrategy::Batch => "BATCH",
        };
        f.write_str(s)
    }
}

pub struct WritePipeline {
    router: Arc<dyn RoutingHandler>,
    factory: Arc<dyn WorkerFactory>,
    ctx: Arc<ExecutionContext>,
    aggregator: Aggregator,
}

impl WritePipeline {
    pub fn new(
        router: Arc<dyn RoutingHandler>,
        factory: Arc<dyn WorkerFactory>,
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            router,
            factory,
            ctx,
            aggregator: Aggregator::new(),
        }
    }

    pub fn router(&self) -> &dyn RoutingHandler {
        self.router.as_ref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Affected rows accumulated since the last `reset`.
    pub fn total(&self) -> u64 {
        self.aggregator.running_total()
    }

    pub fn flushes(&self) -> usize {
        self.aggregator.flushes()
    }

    pub fn reset(&mut self) {
        self.aggregator.reset();
    }

    // ── Planning ──

    /// One worker per (row, target node), in row order.
    pub fn plan_rows<F>(&self, table: &str, rows: &[OwnedRow], mut translate: F) -> DdalResult<WorkerSet>
    where
        F: FnMut(&ObjectNode, &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)>,
    {
        let mut workers = WorkerSet::new();
        for row in rows {
            let route = self.router.route_row(table, row)?;
            for node in route.nodes() {
                let (command, params) = translate(node, row)?;
                workers.push(self.factory.create_update_worker(command, node, vec![params]));
            }
        }
        Ok(workers)
    }

    /// One worker per routed node, each carrying the same parameter row.
    pub fn plan_routed<F>(&self, route: &RoutingResult, row: &OwnedRow, mut translate: F) -> DdalResult<WorkerSet>
    where
        F: FnMut(&ObjectNode, &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)>,
    {
        let mut workers = WorkerSet::new();
        for node in route.nodes() {
            let (command, params) = translate(node, row)?;
            workers.push(self.factory.create_update_worker(command, node, vec![params]));
        }
        Ok(workers)
    }

    /// Merge when the flush has more workers than the merge threshold, or
    /// when all of them share one batch key.
    pub fn strategy_for(&self, workers: &WorkerSet) -> ExecutionStrategy {
        match workers.len() {
            0 => ExecutionStrategy::Empty,
            1 => ExecutionStrategy::Single,
            n if n > self.ctx.batch_merge_threshold() || workers.distinct_keys() == 1 => {
                ExecutionStrategy::Batch
            }
            _ => ExecutionStrategy::Multiple,
        }
    }

    /// Apply the merge step of `strategy`.
    pub fn prepare_workers(&self, workers: WorkerSet, strategy: ExecutionStrategy) -> WorkerSet {
        if strategy != ExecutionStrategy::Batch {
            return workers;
        }
        let before = workers.len();
        let merged = WorkerSet::from(self.factory.merge_to_batch(workers.into_workers()));
        self.ctx.stats().batch_merges.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(before, after = merged.len(), "merged workers by batch key");
        merged
    }

    // ── Execution ──

    /// Route, dispatch and fold one flush of logical rows. Returns the rows
    /// affected by this flush.
    pub fn flush_rows<F>(&mut self, table: &str, rows: Vec<OwnedRow>, translate: F) -> DdalResult<u64>
    where
        F: FnMut(&ObjectNode, &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)>,
    {
        self.ctx.check_canceled()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let stats = self.ctx.stats();
        stats.flushes.fetch_add(1, Ordering::Relaxed);
        let workers = self.plan_rows(table, &rows, translate)?;
        let workers = if rows.len() == 1 {
            // Single-row path: no merge step, one row can still fan out to
            // several nodes.
            stats.single_row_flushes.fetch_add(1, Ordering::Relaxed);
            workers
        } else {
            let strategy = self.strategy_for(&workers);
            self.prepare_workers(workers, strategy)
        };
        tracing::debug!(
            table,
            rows = rows.len(),
            workers = workers.len(),
            flush = self.aggregator.flushes() + 1,
            "flushing rows"
        );
        self.dispatch(workers)
    }

    /// Dispatch one parameter row to every routed node (UPDATE / DELETE).
    pub fn flush_routed<F>(&mut self, route: &RoutingResult, row: &OwnedRow, translate: F) -> DdalResult<u64>
    where
        F: FnMut(&ObjectNode, &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)>,
    {
        self.ctx.check_canceled()?;
        let stats = self.ctx.stats();
        stats.flushes.fetch_add(1, Ordering::Relaxed);
        stats.single_row_flushes.fetch_add(1, Ordering::Relaxed);
        let workers = self.plan_routed(route, row, translate)?;
        tracing::debug!(nodes = route.len(), "flushing routed statement");
        self.dispatch(workers)
    }

    fn dispatch(&mut self, workers: WorkerSet) -> DdalResult<u64> {
        let outcomes = Dispatcher::execute(workers, &self.ctx);
        self.aggregator.add_flush(outcomes)
    }
}

/// Render a planned worker set for EXPLAIN.
pub fn render_plan(header: &str, strategy: ExecutionStrategy, workers: &WorkerSet) -> String {
    let mut out = format!(
        "{} [{}] workers={} rows={}",
        header,
        strategy,
        workers.len(),
        workers.row_count()
    );
    for w in workers.iter() {
        out.push_str(&format!("\n  {} -> {} ({} row(s))", w.shard(), w.sql(), w.row_count()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PoolHandle;
    use crate::pool::ExecutionPool;
    use crate::worker::ShardWorkerFactory;
    use ddal_cluster::repo::MemoryCluster;
    use ddal_cluster::routing::{RuleRouter, TableRule};
    use ddal_common::config::ExecutorConfig;
    use ddal_common::types::ColumnId;

    fn pipeline(shards: usize) -> (MemoryCluster, WritePipeline) {
        let cluster = MemoryCluster::new();
        let mut nodes = Vec::new();
        for i in 0..shards {
            cluster.create_table(&format!("s{}", i), &format!("t_{}", i), &["id"]);
            nodes.push(ObjectNode::new(format!("s{}", i), format!("t_{}", i)));
        }
        let router = RuleRouter::new().with_rule(TableRule::hash("t", vec![(ColumnId(0), "id".into())], nodes));
        let ctx = ExecutionContext::with_pool(
            &ExecutorConfig::default(),
            Arc::new(PoolHandle::Owned(ExecutionPool::new(2))),
        );
        let p = WritePipeline::new(
            Arc::new(router),
            Arc::new(ShardWorkerFactory::new(Arc::new(cluster.clone()))),
            Arc::new(ctx),
        );
        (cluster, p)
    }

    fn insert(node: &ObjectNode, row: &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)> {
        Ok((
            ShardCommand::Insert {
                table: node.object.clone(),
                columns: vec!["id".into()],
            },
            row.values.clone(),
        ))
    }

    fn rows(n: i64) -> Vec<OwnedRow> {
        (0..n).map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect()
    }

    #[test]
    fn test_strategy_selection() {
        let (_c, p) = pipeline(4);
        assert_eq!(p.strategy_for(&WorkerSet::new()), ExecutionStrategy::Empty);
        let one = p.plan_rows("t", &rows(1), insert).unwrap();
        assert_eq!(p.strategy_for(&one), ExecutionStrategy::Single);
        let six = p.plan_rows("t", &rows(6), insert).unwrap();
        assert_eq!(p.strategy_for(&six), ExecutionStrategy::Batch);
    }

    #[test]
    fn test_same_key_workers_always_merge() {
        let (c, mut p) = pipeline(1);
        assert_eq!(p.flush_rows("t", rows(3), insert).unwrap(), 3);
        assert_eq!(c.round_trips(), 1);
        assert_eq!(p.context().stats().snapshot().batch_merges, 1);
    }

    #[test]
    fn test_flushes_accumulate() {
        let (c, mut p) = pipeline(2);
        p.flush_rows("t", rows(4), insert).unwrap();
        p.flush_rows("t", rows(1), insert).unwrap();
        assert_eq!(p.total(), 5);
        assert_eq!(p.flushes(), 2);
        assert_eq!(c.row_count("s0", "t_0") + c.row_count("s1", "t_1"), 5);
        let stats = p.context().stats().snapshot();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.single_row_flushes, 1);
    }

    #[test]
    fn test_cancelled_statement_skips_flush() {
        let (c, mut p) = pipeline(2);
        p.context().begin_statement();
        p.context().cancel();
        assert!(p.flush_rows("t", rows(2), insert).is_err());
        assert_eq!(c.connections_opened(), 0);
    }

    #[test]
    fn test_render_plan() {
        let (_c, p) = pipeline(1);
        let workers = p.plan_rows("t", &rows(2), insert).unwrap();
        let merged = p.prepare_workers(workers, ExecutionStrategy::Batch);
        let plan = render_plan("INSERT INTO t", ExecutionStrategy::Batch, &merged);
        assert_eq!(
            plan,
            "INSERT INTO t [BATCH] workers=1 rows=2\n  s0 -> INSERT INTO t_0 (id) VALUES (?) (2 row(s))"
        );
    }
}
