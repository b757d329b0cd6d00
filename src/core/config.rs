use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MEMORY_STORE_SCHEME: &str = "memory://";

/// Top-level configuration for a gateway node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub route_cache: RouteCacheConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub node_rpc: NodeRpcConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub hook: HookConfig,
    /// Tenants this node accepts connections for, keyed by tenant id.
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    /// Endpoint peers use to reach this node's RPC service.
    pub public_endpoint: String,
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: String,
    #[serde(default = "default_node_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Shared secret peers must present on node RPC calls.
    #[serde(default)]
    pub cluster_token: Option<String>,
    #[serde(default = "default_snapshot_refresh_ms")]
    pub snapshot_refresh_ms: u64,
    #[serde(default = "default_dead_node_cleanup_seconds")]
    pub dead_node_cleanup_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub connection_string: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub metrics_bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_group_route_chunk_size")]
    pub group_route_chunk_size: usize,
    #[serde(default = "default_group_offline_buffer_max_users")]
    pub group_offline_buffer_max_users: usize,
    #[serde(default = "default_group_members_max_users")]
    pub group_members_max_users: usize,
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    #[serde(default = "default_offline_max_messages")]
    pub max_messages_per_user: usize,
    #[serde(default = "default_offline_max_bytes")]
    pub max_bytes_per_user: usize,
    #[serde(default = "default_offline_max_users")]
    pub max_users_per_tenant: usize,
    #[serde(default = "default_offline_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteCacheConfig {
    /// Zero disables local route caching.
    #[serde(default = "default_route_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Zero disables local route caching.
    #[serde(default = "default_route_cache_max_bytes")]
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub default_timeout_seconds: u32,
    #[serde(default = "default_heartbeat_snapshot_refresh_ms")]
    pub snapshot_refresh_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_drain_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_admission_retry_capacity")]
    pub retry_queue_capacity: usize,
    #[serde(default = "default_admission_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_admission_retry_backoff_ms")]
    pub retry_backoff_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRpcConfig {
    #[serde(default = "default_node_rpc_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_node_rpc_max_attempts")]
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_open_ms")]
    pub breaker_open_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Noop,
    Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_producer_kind")]
    pub producer: ProducerKind,
    #[serde(default = "default_events_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_events_max_pending_per_tenant")]
    pub max_pending_per_tenant: usize,
    #[serde(default = "default_events_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_events_backoff_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_dlq_queue_capacity")]
    pub dlq_queue_capacity: usize,
    #[serde(default = "default_dlq_max_attempts")]
    pub dlq_max_attempts: u32,
    #[serde(default = "default_dlq_backoff_ms")]
    pub dlq_backoff_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default = "default_hook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_hook_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_hook_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_open_ms")]
    pub breaker_open_ms: u64,
    #[serde(default)]
    pub sign_required: bool,
    /// Allow messages when the check-message hook is unreachable.
    #[serde(default)]
    pub check_message_fail_open: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Base URL of the tenant's policy hook; `/auth` is appended.
    pub auth_url: String,
    /// Signing secret used until the auth hook hands out a tenant secret.
    #[serde(default)]
    pub hook_secret: Option<String>,
    #[serde(default)]
    pub hook_max_concurrency: Option<u32>,
}

impl Config {
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut config = Self::load(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = if is_json(path) {
            serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse JSON config {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse TOML config {}", path.display()))?
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            bail!("node.node_id is required");
        }
        if self.node.public_endpoint.trim().is_empty() {
            bail!("node.public_endpoint is required");
        }
        if self.node.ttl_seconds == 0 {
            bail!("node.ttl_seconds must be non-zero");
        }
        let conn = self.store.connection_string.trim();
        if conn.is_empty() {
            bail!("store.connection_string is required");
        }
        if conn != MEMORY_STORE_SCHEME {
            bail!("unsupported store.connection_string {conn}");
        }
        if self.limits.max_message_bytes == 0 {
            bail!("limits.max_message_bytes must be non-zero");
        }
        if self.limits.group_route_chunk_size == 0 {
            bail!("limits.group_route_chunk_size must be non-zero");
        }
        if self.heartbeat.tick_ms == 0 {
            bail!("heartbeat.tick_ms must be non-zero");
        }
        if self.events.queue_capacity == 0 || self.events.dlq_queue_capacity == 0 {
            bail!("events queue capacities must be non-zero");
        }
        if self.admission.retry_queue_capacity == 0 {
            bail!("admission.retry_queue_capacity must be non-zero");
        }
        for (tenant, cfg) in &self.tenants {
            if tenant.trim().is_empty() {
                bail!("tenant ids must be non-empty");
            }
            if cfg.auth_url.trim().is_empty() {
                bail!("tenants.{tenant}.auth_url is required");
            }
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("COURIER_NODE_ID") {
            self.node.node_id = node_id;
        }
        if let Ok(store) = std::env::var("COURIER_STORE") {
            self.store.connection_string = store;
        }
        if let Ok(token) = std::env::var("COURIER_CLUSTER_TOKEN") {
            self.node.cluster_token = Some(token).filter(|t| !t.is_empty());
        }
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node.ttl_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain.timeout_seconds)
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("COURIER_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/courier.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_rpc_bind() -> String {
    "0.0.0.0:7100".into()
}

fn default_node_ttl_seconds() -> u64 {
    30
}

fn default_snapshot_refresh_ms() -> u64 {
    3_000
}

fn default_dead_node_cleanup_seconds() -> u64 {
    30
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_group_route_chunk_size() -> usize {
    256
}

fn default_group_offline_buffer_max_users() -> usize {
    1024
}

fn default_group_members_max_users() -> usize {
    200_000
}

fn default_dedup_ttl_seconds() -> u64 {
    600
}

fn default_offline_max_messages() -> usize {
    128
}

fn default_offline_max_bytes() -> usize {
    1024 * 1024
}

fn default_offline_max_users() -> usize {
    10_000
}

fn default_offline_ttl_seconds() -> u64 {
    300
}

fn default_route_cache_ttl_ms() -> u64 {
    1_000
}

fn default_route_cache_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_heartbeat_tick_ms() -> u64 {
    1_000
}

fn default_heartbeat_timeout_seconds() -> u32 {
    30
}

fn default_heartbeat_snapshot_refresh_ms() -> u64 {
    5_000
}

fn default_drain_timeout_seconds() -> u64 {
    10
}

fn default_admission_retry_capacity() -> usize {
    10_000
}

fn default_admission_retry_attempts() -> u32 {
    5
}

fn default_admission_retry_backoff_ms() -> u64 {
    200
}

fn default_node_rpc_timeout_ms() -> u64 {
    250
}

fn default_node_rpc_max_attempts() -> u32 {
    2
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_open_ms() -> u64 {
    5_000
}

fn default_producer_kind() -> ProducerKind {
    ProducerKind::Noop
}

fn default_events_queue_capacity() -> usize {
    50_000
}

fn default_events_max_pending_per_tenant() -> usize {
    10_000
}

fn default_events_max_attempts() -> u32 {
    3
}

fn default_events_backoff_ms() -> u64 {
    50
}

fn default_dlq_queue_capacity() -> usize {
    5_000
}

fn default_dlq_max_attempts() -> u32 {
    2
}

fn default_dlq_backoff_ms() -> u64 {
    100
}

fn default_hook_timeout_ms() -> u64 {
    150
}

fn default_hook_max_concurrency() -> u32 {
    32
}

fn default_hook_queue_timeout_ms() -> u64 {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            group_route_chunk_size: default_group_route_chunk_size(),
            group_offline_buffer_max_users: default_group_offline_buffer_max_users(),
            group_members_max_users: default_group_members_max_users(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_messages_per_user: default_offline_max_messages(),
            max_bytes_per_user: default_offline_max_bytes(),
            max_users_per_tenant: default_offline_max_users(),
            default_ttl_seconds: default_offline_ttl_seconds(),
        }
    }
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_route_cache_ttl_ms(),
            max_bytes: default_route_cache_max_bytes(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_heartbeat_tick_ms(),
            default_timeout_seconds: default_heartbeat_timeout_seconds(),
            snapshot_refresh_ms: default_heartbeat_snapshot_refresh_ms(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_drain_timeout_seconds(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            retry_queue_capacity: default_admission_retry_capacity(),
            retry_max_attempts: default_admission_retry_attempts(),
            retry_backoff_base_ms: default_admission_retry_backoff_ms(),
        }
    }
}

impl Default for NodeRpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_node_rpc_timeout_ms(),
            max_attempts: default_node_rpc_max_attempts(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_open_ms: default_breaker_open_ms(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            producer: default_producer_kind(),
            queue_capacity: default_events_queue_capacity(),
            max_pending_per_tenant: default_events_max_pending_per_tenant(),
            max_attempts: default_events_max_attempts(),
            retry_backoff_base_ms: default_events_backoff_ms(),
            dlq_queue_capacity: default_dlq_queue_capacity(),
            dlq_max_attempts: default_dlq_max_attempts(),
            dlq_backoff_base_ms: default_dlq_backoff_ms(),
        }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_hook_timeout_ms(),
            max_concurrency: default_hook_max_concurrency(),
            queue_timeout_ms: default_hook_queue_timeout_ms(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_open_ms: default_breaker_open_ms(),
            sign_required: false,
            check_message_fail_open: false,
        }
    }
}
