//! Cross-node delivery.
//!
//! - `breaker` - Generic per-target circuit breaker
//! - `rpc` - Node RPC envelopes and paths
//! - `pool` - Lazily created HTTP clients per peer endpoint
//! - `service` - Receiving side, an axum router over the local registry and offline store
//! - `sender` - Breaker-gated outbound calls and home-node offline routing
//! - `fanout` - Group recipient partitioning by owning node

pub mod breaker;
pub mod fanout;
pub mod pool;
pub mod rpc;
pub mod sender;
pub mod service;

pub use breaker::{BreakerAttempt, BreakerPhase, BreakerPolicy, CircuitBreaker};
pub use fanout::{build_buckets, unrouted_members, NodeBucket};
pub use pool::{NodeClient, NodeClientPool, NodeRpcError};
pub use rpc::{ForwardAck, NODE_TOKEN_HEADER};
pub use sender::{NodeForwarder, OfflineRouter};
pub use service::NodeGatewayService;
