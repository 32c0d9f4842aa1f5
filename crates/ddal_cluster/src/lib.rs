//! Cluster side of the DDAL execution layer: sharding rules and row
//! routing, the shard connection seam, an in-memory shard repository and
//! per-shard fault injection.

pub mod fault_injection;
pub mod repo;
pub mod routing;
pub mod sharding;

pub use fault_injection::ShardFaults;
pub use repo::{MemoryCluster, ShardCommand, ShardConnection, ShardConnector};
pub use routing::{ObjectNode, RoutingHandler, RoutingResult, RuleRouter, ShardPolicy, TableRule};
