//! Distributed DML execution.
//!
//! Builds typed rows from prepared statements, buffers them, routes each
//! flush to shard-bound workers, dispatches those workers inline or on the
//! execution pool, and folds their outcomes into an affected-row count.

pub mod aggregator;
pub mod context;
pub mod dispatcher;
pub mod executor_delete;
pub mod executor_insert;
pub mod executor_update;
pub mod expression;
pub mod framework;
pub mod pool;
pub mod prepared;
pub mod row_buffer;
pub mod row_builder;
pub mod worker;

pub use aggregator::Aggregator;
pub use context::{ExecutionContext, PoolHandle};
pub use dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher};
pub use executor_delete::DeleteExecutor;
pub use executor_insert::InsertExecutor;
pub use executor_update::UpdateExecutor;
pub use expression::Expression;
pub use framework::{DmlExecutor, ExecutionStrategy, WritePipeline};
pub use pool::ExecutionPool;
pub use prepared::{Delete, Insert, ResultTarget, RowSource, Update, VecRowSource};
pub use row_buffer::RowBuffer;
pub use row_builder::RowBuilder;
pub use worker::{BatchKey, ShardWorkerFactory, UpdateWorker, WorkerFactory, WorkerOutcome, WorkerSet};
