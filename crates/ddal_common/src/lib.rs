//! Shared types for the DDAL execution layer: datums and rows, logical
//! table metadata, the error taxonomy, configuration and cancellation.

pub mod cancel;
pub mod config;
pub mod datum;
pub mod error;
pub mod schema;
pub mod types;

pub use cancel::CancelToken;
pub use config::{
    ClusterConfig, DdalConfig, ExecutorConfig, NodeConfig, ShardPolicyConfig, TableRuleConfig,
};
pub use datum::{Datum, OwnedRow};
pub use error::{
    ConversionError, DdalError, DdalResult, ErrorKind, MetadataError, RoutingError, ShardError,
};
pub use schema::{Catalog, ColumnDef, TableMetaProvider, TableSchema};
pub use types::{ColumnId, DataType, DmlKind, TableId, WorkerId};
