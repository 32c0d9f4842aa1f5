//! Shard-bound units of work and their factory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ddal_cluster::repo::{ShardCommand, ShardConnection, ShardConnector};
use ddal_cluster::routing::ObjectNode;
use ddal_common::cancel::CancelToken;
use ddal_common::datum::Datum;
use ddal_common::error::{DdalError, DdalResult, ShardError};
use ddal_common::types::WorkerId;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a mergeable worker: target shard + rendered SQL. Row data
/// never participates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub shard: String,
    pub sql: String,
}

impl BatchKey {
    pub fn new(shard: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            sql: sql.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.shard, self.sql)
    }
}

/// One statement shape bound to one shard with one or more parameter rows.
///
/// The connection is opened lazily by `do_work` and released by
/// `close_resource`, which the dispatcher calls on every completion path.
pub struct UpdateWorker {
    id: WorkerId,
    key: BatchKey,
    command: ShardCommand,
    params: Vec<Vec<Datum>>,
    connector: Arc<dyn ShardConnector>,
    connection: Option<Box<dyn ShardConnection>>,
    cancel: CancelToken,
}

impl UpdateWorker {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        node: &ObjectNode,
        command: ShardCommand,
        params: Vec<Vec<Datum>>,
    ) -> Self {
        let key = BatchKey::new(&node.shard, command.sql());
        Self {
            id: WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)),
            key,
            command,
            params,
            connector,
            connection: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn shard(&self) -> &str {
        &self.key.shard
    }

    pub fn sql(&self) -> &str {
        &self.key.sql
    }

    pub fn params(&self) -> &[Vec<Datum>] {
        &self.params
    }

    /// Parameter rows carried by this worker.
    pub fn row_count(&self) -> usize {
        self.params.len()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn has_resource(&self) -> bool {
        self.connection.is_some()
    }

    /// Append another worker's parameter rows after this worker's own.
    pub fn absorb(&mut self, mut other: UpdateWorker) {
        debug_assert_eq!(self.key, other.key);
        other.close_resource();
        self.params.append(&mut other.params);
    }

    /// Execute all parameter rows on the target shard in one round trip.
    /// Returns per-row affected counts in parameter order.
    pub fn do_work(&mut self) -> DdalResult<Vec<u64>> {
        self.cancel.check()?;
        if self.connection.is_none() {
            let conn = self
                .connector
                .connect(&self.key.shard)
                .map_err(|e| self.remote_error(e))?;
            self.connection = Some(conn);
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err(DdalError::internal_bug(
                "E-WORKER-001",
                "connection missing after open",
                self.key.to_string(),
            ));
        };
        let counts = match conn.execute_batch(&self.command, &self.params, &self.cancel) {
            Ok(counts) => counts,
            Err(e) => return Err(self.remote_error(e)),
        };
        if counts.len() != self.params.len() {
            return Err(DdalError::internal_bug(
                "E-WORKER-002",
                format!(
                    "shard returned {} count(s) for {} parameter row(s)",
                    counts.len(),
                    self.params.len()
                ),
                self.key.to_string(),
            ));
        }
        Ok(counts)
    }

    /// Release the shard connection. Idempotent: returns `true` only on the
    /// call that actually released it.
    pub fn close_resource(&mut self) -> bool {
        match self.connection.take() {
            Some(mut conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    fn remote_error(&self, e: ShardError) -> DdalError {
        match e {
            ShardError::Cancelled => DdalError::Cancelled,
            other => DdalError::remote(&self.key.shard, &self.key.sql, other),
        }
    }
}

impl fmt::Debug for UpdateWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateWorker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("rows", &self.params.len())
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// Per-worker result handed back by the dispatcher.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub worker: WorkerId,
    pub shard: String,
    pub result: DdalResult<Vec<u64>>,
}

impl WorkerOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// The workers of one flush. Created per flush and consumed by dispatch.
#[derive(Debug, Default)]
pub struct WorkerSet {
    workers: Vec<UpdateWorker>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, worker: UpdateWorker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateWorker> {
        self.workers.iter()
    }

    /// Total parameter rows across all workers.
    pub fn row_count(&self) -> usize {
        self.workers.iter().map(|w| w.row_count()).sum()
    }

    /// Number of distinct batch keys.
    pub fn distinct_keys(&self) -> usize {
        let mut seen: Vec<&BatchKey> = Vec::new();
        for w in &self.workers {
            if !seen.contains(&w.key()) {
                seen.push(w.key());
            }
        }
        seen.len()
    }

    pub fn into_workers(self) -> Vec<UpdateWorker> {
        self.workers
    }
}

impl From<Vec<UpdateWorker>> for WorkerSet {
    fn from(workers: Vec<UpdateWorker>) -> Self {
        Self { workers }
    }
}

/// Remote execution handle factory.
pub trait WorkerFactory: Send + Sync {
    fn create_update_worker(
        &self,
        command: ShardCommand,
        node: &ObjectNode,
        params: Vec<Vec<Datum>>,
    ) -> UpdateWorker;

    /// Combine workers that share a `BatchKey` into one worker carrying the
    /// union of their parameter rows.
    fn merge_to_batch(&self, workers: Vec<UpdateWorker>) -> Vec<UpdateWorker>;
}

/// Factory backed by a `ShardConnector`.
pub struct ShardWorkerFactory {
    connector: Arc<dyn ShardConnector>,
}

impl ShardWorkerFactory {
    pub fn new(connector: Arc<dyn ShardConnector>) -> Self {
        Self { connector }
    }
}

impl WorkerFactory for ShardWorkerFactory {
    fn create_update_worker(
        &self,
        command: ShardCommand,
        node: &ObjectNode,
        params: Vec<Vec<Datum>>,
    ) -> UpdateWorker {
        UpdateWorker::new(Arc::clone(&self.connector), node, command, params)
    }

    /// Keys keep their first-appearance order; rows keep input order within
    /// a key.
    fn merge_to_batch(&self, workers: Vec<UpdateWorker>) -> Vec<UpdateWorker> {
        let mut slots: HashMap<BatchKey, usize> = HashMap::new();
        let mut merged: Vec<UpdateWorker> = Vec::new();
        for worker in workers {
            match slots.get(worker.key()) {
                Some(&slot) => merged[slot].absorb(worker),
                None => {
                    slots.insert(worker.key().clone(), merged.len());
                    merged.push(worker);
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddal_cluster::repo::MemoryCluster;

    fn cluster() -> MemoryCluster {
        let c = MemoryCluster::new();
        c.create_table("s0", "t_0", &["id", "v"]);
        c.create_table("s1", "t_1", &["id", "v"]);
        c
    }

    fn insert(table: &str) -> ShardCommand {
        ShardCommand::Insert {
            table: table.into(),
            columns: vec!["id".into(), "v".into()],
        }
    }

    fn row(i: i64) -> Vec<Datum> {
        vec![Datum::Int64(i), Datum::Text(format!("v{}", i))]
    }

    #[test]
    fn test_batch_key_ignores_rows() {
        let c = cluster();
        let f = ShardWorkerFactory::new(Arc::new(c));
        let n = ObjectNode::new("s0", "t_0");
        let a = f.create_update_worker(insert("t_0"), &n, vec![row(1)]);
        let b = f.create_update_worker(insert("t_0"), &n, vec![row(2)]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.sql(), "INSERT INTO t_0 (id, v) VALUES (?, ?)");
    }

    #[test]
    fn test_merge_preserves_key_and_row_order() {
        let c = cluster();
        let f = ShardWorkerFactory::new(Arc::new(c));
        let n0 = ObjectNode::new("s0", "t_0");
        let n1 = ObjectNode::new("s1", "t_1");
        let workers = vec![
            f.create_update_worker(insert("t_1"), &n1, vec![row(1)]),
            f.create_update_worker(insert("t_0"), &n0, vec![row(2)]),
            f.create_update_worker(insert("t_1"), &n1, vec![row(3)]),
            f.create_update_worker(insert("t_0"), &n0, vec![row(4)]),
            f.create_update_worker(insert("t_1"), &n1, vec![row(5)]),
        ];
        let merged = f.merge_to_batch(workers);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].shard(), "s1");
        assert_eq!(merged[0].params(), &[row(1), row(3), row(5)]);
        assert_eq!(merged[1].params(), &[row(2), row(4)]);
    }

    #[test]
    fn test_distinct_shards_never_merge() {
        let c = cluster();
        let f = ShardWorkerFactory::new(Arc::new(c));
        let workers = vec![
            f.create_update_worker(insert("t_0"), &ObjectNode::new("s0", "t_0"), vec![row(1)]),
            f.create_update_worker(insert("t_1"), &ObjectNode::new("s1", "t_1"), vec![row(2)]),
        ];
        let set = WorkerSet::from(f.merge_to_batch(workers));
        assert_eq!(set.len(), 2);
        assert_eq!(set.distinct_keys(), 2);
        assert_eq!(set.row_count(), 2);
    }

    #[test]
    fn test_do_work_and_close_once() {
        let c = cluster();
        let f = ShardWorkerFactory::new(Arc::new(c.clone()));
        let mut w = f.create_update_worker(
            insert("t_0"),
            &ObjectNode::new("s0", "t_0"),
            vec![row(1), row(2), row(3)],
        );
        assert_eq!(w.do_work().unwrap(), vec![1, 1, 1]);
        assert!(w.has_resource());
        assert!(w.close_resource());
        assert!(!w.close_resource());
        assert_eq!(c.connections_opened(), 1);
        assert_eq!(c.connections_closed(), 1);
        assert_eq!(c.double_closes(), 0);
        assert_eq!(c.round_trips(), 1);
        assert_eq!(c.row_count("s0", "t_0"), 3);
    }

    #[test]
    fn test_remote_failure_is_wrapped() {
        let c = cluster();
        c.faults().fail_next("s1", "constraint violated");
        let f = ShardWorkerFactory::new(Arc::new(c.clone()));
        let mut w = f.create_update_worker(insert("t_1"), &ObjectNode::new("s1", "t_1"), vec![row(1)]);
        let err = w.do_work().unwrap_err();
        assert!(err.is_remote());
        assert_eq!(
            err.root_cause(),
            Some(&ShardError::Remote("constraint violated".into()))
        );
        assert!(w.close_resource());
    }

    #[test]
    fn test_cancelled_worker_never_connects() {
        let c = cluster();
        let f = ShardWorkerFactory::new(Arc::new(c.clone()));
        let mut w = f.create_update_worker(insert("t_0"), &ObjectNode::new("s0", "t_0"), vec![row(1)]);
        w.cancel_token().cancel();
        assert!(matches!(w.do_work(), Err(DdalError::Cancelled)));
        assert_eq!(c.connections_opened(), 0);
        assert!(!w.close_resource());
    }
}
