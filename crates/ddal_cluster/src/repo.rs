//! Shard connection seam and an in-process shard repository.
//!
//! `ShardConnector` / `ShardConnection` are the narrow interface through
//! which workers reach a physical shard. `MemoryCluster` implements it with
//! shards that keep physical tables in memory and apply parameterised
//! commands structurally. It counts every opened and closed connection and
//! every round trip so callers can verify resource release and batching.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ddal_common::cancel::CancelToken;
use ddal_common::config::ClusterConfig;
use ddal_common::datum::Datum;
use ddal_common::error::{DdalResult, ShardError};
use ddal_common::schema::TableMetaProvider;
use parking_lot::Mutex;

use crate::fault_injection::ShardFaults;

/// Parameterised statement shape sent to one physical table.
///
/// Each parameter row supplies values in placeholder order: INSERT takes
/// `columns`, UPDATE takes `set` followed by `filter`, DELETE takes `filter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardCommand {
    Insert {
        table: String,
        columns: Vec<String>,
    },
    Update {
        table: String,
        set: Vec<String>,
        filter: Vec<String>,
    },
    Delete {
        table: String,
        filter: Vec<String>,
    },
}

impl ShardCommand {
    pub fn table(&self) -> &str {
        match self {
            ShardCommand::Insert { table, .. }
            | ShardCommand::Update { table, .. }
            | ShardCommand::Delete { table, .. } => table,
        }
    }

    /// Placeholders per parameter row.
    pub fn param_count(&self) -> usize {
        match self {
            ShardCommand::Insert { columns, .. } => columns.len(),
            ShardCommand::Update { set, filter, .. } => set.len() + filter.len(),
            ShardCommand::Delete { filter, .. } => filter.len(),
        }
    }

    /// Rendered SQL text, e.g. `INSERT INTO orders_1 (id, name) VALUES (?, ?)`.
    pub fn sql(&self) -> String {
        match self {
            ShardCommand::Insert { table, columns } => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            ),
            ShardCommand::Update { table, set, filter } => {
                let assignments: Vec<String> = set.iter().map(|c| format!("{} = ?", c)).collect();
                format!("UPDATE {} SET {}{}", table, assignments.join(", "), where_clause(filter))
            }
            ShardCommand::Delete { table, filter } => {
                format!("DELETE FROM {}{}", table, where_clause(filter))
            }
        }
    }
}

fn where_clause(filter: &[String]) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let preds: Vec<String> = filter.iter().map(|c| format!("{} = ?", c)).collect();
    format!(" WHERE {}", preds.join(" AND "))
}

impl fmt::Display for ShardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// An open connection to one shard. Owned by a single worker at a time.
pub trait ShardConnection: Send {
    fn shard(&self) -> &str;

    /// Execute `command` once per parameter row in one round trip.
    /// Returns affected-row counts in parameter order.
    fn execute_batch(
        &mut self,
        command: &ShardCommand,
        params: &[Vec<Datum>],
        cancel: &CancelToken,
    ) -> Result<Vec<u64>, ShardError>;

    fn close(&mut self);
}

/// Opens connections to shards by identifier.
pub trait ShardConnector: Send + Sync {
    fn connect(&self, shard: &str) -> Result<Box<dyn ShardConnection>, ShardError>;
}

// ── In-memory shards ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct PhysicalTable {
    columns: Vec<String>,
    rows: Vec<Vec<Datum>>,
}

impl PhysicalTable {
    fn column_index(&self, shard: &str, name: &str) -> Result<usize, ShardError> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| ShardError::Remote(format!("unknown column {} on shard {}", name, shard)))
    }

    fn matches(row: &[Datum], filter: &[(usize, &Datum)]) -> bool {
        filter.iter().all(|(idx, v)| row[*idx].sql_eq(v))
    }
}

#[derive(Default)]
struct MemoryShard {
    tables: Mutex<HashMap<String, PhysicalTable>>,
}

#[derive(Default)]
struct ClusterCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    double_closes: AtomicU64,
    round_trips: AtomicU64,
}

struct ClusterInner {
    shards: DashMap<String, Arc<MemoryShard>>,
    round_trips_by_shard: DashMap<String, u64>,
    counters: ClusterCounters,
    faults: Arc<ShardFaults>,
}

/// In-process cluster of memory-backed shards.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                shards: DashMap::new(),
                round_trips_by_shard: DashMap::new(),
                counters: ClusterCounters::default(),
                faults: Arc::new(ShardFaults::new()),
            }),
        }
    }

    /// Create every shard and physical table described by `config`, using
    /// the logical column names from `meta`.
    pub fn from_config(config: &ClusterConfig, meta: &dyn TableMetaProvider) -> DdalResult<Self> {
        let cluster = MemoryCluster::new();
        for shard in &config.shards {
            cluster.add_shard(shard);
        }
        for table in &config.tables {
            let schema = meta.table(&table.name)?;
            let columns: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
            for node in &table.nodes {
                cluster.create_table(&node.shard, &node.table, &columns);
            }
        }
        tracing::info!(
            shards = cluster.shard_count(),
            tables = config.tables.len(),
            "in-memory cluster ready"
        );
        Ok(cluster)
    }

    pub fn add_shard(&self, shard: &str) {
        self.inner
            .shards
            .entry(shard.to_string())
            .or_insert_with(|| Arc::new(MemoryShard::default()));
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Create (or replace) a physical table, adding the shard if needed.
    pub fn create_table(&self, shard: &str, table: &str, columns: &[&str]) {
        self.add_shard(shard);
        if let Some(s) = self.inner.shards.get(shard) {
            s.tables.lock().insert(
                table.to_lowercase(),
                PhysicalTable {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows: Vec::new(),
                },
            );
        }
    }

    /// Snapshot of a physical table's rows in storage order.
    pub fn rows(&self, shard: &str, table: &str) -> Vec<Vec<Datum>> {
        let Some(s) = self.inner.shards.get(shard) else {
            return Vec::new();
        };
        let tables = s.tables.lock();
        tables
            .get(&table.to_lowercase())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, shard: &str, table: &str) -> usize {
        self.rows(shard, table).len()
    }

    pub fn faults(&self) -> &ShardFaults {
        &self.inner.faults
    }

    pub fn connections_opened(&self) -> u64 {
        self.inner.counters.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.inner.counters.closed.load(Ordering::SeqCst)
    }

    /// Connections opened but not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.connections_opened()
            .saturating_sub(self.connections_closed())
    }

    /// Close calls on an already-closed connection.
    pub fn double_closes(&self) -> u64 {
        self.inner.counters.double_closes.load(Ordering::SeqCst)
    }

    pub fn round_trips(&self) -> u64 {
        self.inner.counters.round_trips.load(Ordering::SeqCst)
    }

    pub fn round_trips_on(&self, shard: &str) -> u64 {
        self.inner
            .round_trips_by_shard
            .get(shard)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        let c = &self.inner.counters;
        c.opened.store(0, Ordering::SeqCst);
        c.closed.store(0, Ordering::SeqCst);
        c.double_closes.store(0, Ordering::SeqCst);
        c.round_trips.store(0, Ordering::SeqCst);
        self.inner.round_trips_by_shard.clear();
    }
}

impl ShardConnector for MemoryCluster {
    fn connect(&self, shard: &str) -> Result<Box<dyn ShardConnection>, ShardError> {
        self.inner.faults.check_connect(shard)?;
        let target = self
            .inner
            .shards
            .get(shard)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ShardError::ConnectionRefused(shard.to_string()))?;
        self.inner.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shard_name: shard.to_string(),
            shard: target,
            cluster: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    shard_name: String,
    shard: Arc<MemoryShard>,
    cluster: Arc<ClusterInner>,
    closed: bool,
}

impl MemoryConnection {
    fn apply(
        &self,
        command: &ShardCommand,
        params: &[Vec<Datum>],
    ) -> Result<Vec<u64>, ShardError> {
        let mut tables = self.shard.tables.lock();
        let table = tables
            .get_mut(&command.table().to_lowercase())
            .ok_or_else(|| ShardError::TableMissing {
                shard: self.shard_name.clone(),
                table: command.table().to_string(),
            })?;
        let expected = command.param_count();
        let mut counts = Vec::with_capacity(params.len());

        for row in params {
            if row.len() != expected {
                return Err(ShardError::Remote(format!(
                    "expected {} parameter(s), got {}",
                    expected,
                    row.len()
                )));
            }
            let count = match command {
                ShardCommand::Insert { columns, .. } => {
                    let mut physical = vec![Datum::Null; table.columns.len()];
                    for (name, value) in columns.iter().zip(row) {
                        let idx = table.column_index(&self.shard_name, name)?;
                        physical[idx] = value.clone();
                    }
                    table.rows.push(physical);
                    1
                }
                ShardCommand::Update { set, filter, .. } => {
                    let set_idx = set
                        .iter()
                        .map(|c| table.column_index(&self.shard_name, c))
                        .collect::<Result<Vec<_>, _>>()?;
                    let filter_idx = filter
                        .iter()
                        .map(|c| table.column_index(&self.shard_name, c))
                        .collect::<Result<Vec<_>, _>>()?;
                    let (set_vals, filter_vals) = row.split_at(set.len());
                    let preds: Vec<(usize, &Datum)> =
                        filter_idx.into_iter().zip(filter_vals.iter()).collect();
                    let mut n = 0;
                    for stored in table.rows.iter_mut() {
                        if PhysicalTable::matches(stored, &preds) {
                            for (idx, v) in set_idx.iter().zip(set_vals) {
                                stored[*idx] = v.clone();
                            }
                            n += 1;
                        }
                    }
                    n
                }
                ShardCommand::Delete { filter, .. } => {
                    let filter_idx = filter
                        .iter()
                        .map(|c| table.column_index(&self.shard_name, c))
                        .collect::<Result<Vec<_>, _>>()?;
                    let preds: Vec<(usize, &Datum)> =
                        filter_idx.into_iter().zip(row.iter()).collect();
                    let before = table.rows.len();
                    table.rows.retain(|stored| !PhysicalTable::matches(stored, &preds));
                    (before - table.rows.len()) as u64
                }
            };
            counts.push(count);
        }
        Ok(counts)
    }
}

impl ShardConnection for MemoryConnection {
    fn shard(&self) -> &str {
        &self.shard_name
    }

    fn execute_batch(
        &mut self,
        command: &ShardCommand,
        params: &[Vec<Datum>],
        cancel: &CancelToken,
    ) -> Result<Vec<u64>, ShardError> {
        if self.closed {
            return Err(ShardError::Remote("connection already closed".into()));
        }
        self.cluster.counters.round_trips.fetch_add(1, Ordering::SeqCst);
        *self
            .cluster
            .round_trips_by_shard
            .entry(self.shard_name.clone())
            .or_insert(0) += 1;
        self.cluster.faults.before_call(&self.shard_name, cancel)?;
        self.apply(command, params)
    }

    fn close(&mut self) {
        if self.closed {
            self.cluster.counters.double_closes.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.closed = true;
        self.cluster.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}
