//! Cluster-wide state: the distributed store, node membership, route table
//! and node ownership.
//!
//! - `store` - Abstract TTL key-value store and the in-memory backend
//! - `rendezvous` - Deterministic node ownership per (tenant, user)
//! - `directory` - Node liveness leases and the live-node snapshot
//! - `routes` - Device route table
//! - `route_cache` - Size-bounded TTL cache in front of the route table
//! - `cleanup` - Reaping routes of dead nodes

pub mod cleanup;
pub mod directory;
pub mod rendezvous;
pub mod route_cache;
pub mod routes;
pub mod store;

pub use cleanup::DeadNodeCleaner;
pub use directory::{NodeDirectory, NodeSnapshot, NodeSnapshotService};
pub use rendezvous::{pick_node, pick_node_id, score, NodeInfo};
pub use route_cache::{build_route_cache, LocalRouteCache, NoopRouteCache, RouteCache};
pub use routes::{OnlineDeviceRoute, RouteRecord, RouteStore, UserRoutes};
pub use store::{open_store, CapacityGuard, GuardedWrite, InMemoryStore, KvStore, StoreError};
