use super::rpc::{
    decode_body, encode_body, BufferOfflineRequest, DrainOfflineRequest, DrainOfflineResponse,
    ForwardAck, ForwardBatchRequest, ForwardSingleRequest, NODE_TOKEN_HEADER,
    PATH_BUFFER_OFFLINE, PATH_DRAIN_OFFLINE, PATH_FORWARD_BATCH, PATH_FORWARD_SINGLE,
    RPC_CONTENT_TYPE,
};
use crate::config::NodeRpcConfig;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeRpcError {
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("peer call exceeded deadline")]
    DeadlineExceeded,
    #[error("peer is shedding load")]
    ResourceExhausted,
    #[error("peer rejected cluster token")]
    Unauthorized,
    #[error("peer returned status {0}")]
    Status(u16),
    #[error("peer codec error: {0}")]
    Codec(String),
    #[error("circuit open for node {0}")]
    CircuitOpen(String),
}

impl NodeRpcError {
    /// Worth another attempt within the same call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeRpcError::Unavailable(_)
                | NodeRpcError::DeadlineExceeded
                | NodeRpcError::ResourceExhausted
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeRpcError::Unavailable(_) => "unavailable",
            NodeRpcError::DeadlineExceeded => "deadline_exceeded",
            NodeRpcError::ResourceExhausted => "resource_exhausted",
            NodeRpcError::Unauthorized => "unauthenticated",
            NodeRpcError::Status(_) => "status",
            NodeRpcError::Codec(_) => "codec",
            NodeRpcError::CircuitOpen(_) => "circuit_open",
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            NodeRpcError::DeadlineExceeded
        } else {
            NodeRpcError::Unavailable(err.to_string())
        }
    }

    fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            401 => NodeRpcError::Unauthorized,
            429 => NodeRpcError::ResourceExhausted,
            502..=504 => NodeRpcError::Unavailable(format!("status {status}")),
            other => NodeRpcError::Status(other),
        }
    }
}

/// HTTP client bound to one peer endpoint.
#[derive(Clone)]
pub struct NodeClient {
    endpoint: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!("failed to build node rpc client: {err:?}");
                reqwest::Client::new()
            });
        Self {
            endpoint: endpoint.into(),
            token,
            http,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}{path}")
        } else {
            format!("http://{base}{path}")
        }
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, NodeRpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = encode_body(request).map_err(|err| NodeRpcError::Codec(err.to_string()))?;
        let mut builder = self
            .http
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, RPC_CONTENT_TYPE)
            .body(body);
        if let Some(token) = &self.token {
            builder = builder.header(NODE_TOKEN_HEADER, token);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| NodeRpcError::from_reqwest(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeRpcError::from_status(status));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| NodeRpcError::from_reqwest(&err))?;
        decode_body(&bytes).map_err(|err| NodeRpcError::Codec(err.to_string()))
    }

    pub async fn forward_single(
        &self,
        request: &ForwardSingleRequest,
    ) -> Result<ForwardAck, NodeRpcError> {
        self.call(PATH_FORWARD_SINGLE, request).await
    }

    pub async fn forward_batch(
        &self,
        request: &ForwardBatchRequest,
    ) -> Result<ForwardAck, NodeRpcError> {
        self.call(PATH_FORWARD_BATCH, request).await
    }

    pub async fn buffer_offline(
        &self,
        request: &BufferOfflineRequest,
    ) -> Result<ForwardAck, NodeRpcError> {
        self.call(PATH_BUFFER_OFFLINE, request).await
    }

    pub async fn drain_offline(
        &self,
        request: &DrainOfflineRequest,
    ) -> Result<DrainOfflineResponse, NodeRpcError> {
        self.call(PATH_DRAIN_OFFLINE, request).await
    }
}

/// Lazily created clients, one per peer endpoint, reused for the process lifetime.
pub struct NodeClientPool {
    token: Option<String>,
    timeout: Duration,
    clients: Mutex<HashMap<String, NodeClient>>,
}

impl NodeClientPool {
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        Self {
            token,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &NodeRpcConfig, token: Option<String>) -> Self {
        Self::new(token, Duration::from_millis(cfg.timeout_ms.max(1)))
    }

    pub fn get(&self, endpoint: &str) -> NodeClient {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(endpoint) {
            return client.clone();
        }
        let client = NodeClient::new(endpoint, self.token.clone(), self.timeout);
        clients.insert(endpoint.to_string(), client.clone());
        client
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached client; in-flight calls keep their own handle.
    pub fn clear(&self) {
        self.clients.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_are_reused_per_endpoint() {
        let pool = NodeClientPool::new(None, Duration::from_millis(250));
        pool.get("http://a:7100");
        pool.get("http://a:7100");
        pool.get("b:7100");
        assert_eq!(pool.len(), 2);
        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn urls_accept_bare_hosts() {
        let client = NodeClient::new("10.0.0.1:7100/", None, Duration::from_millis(10));
        assert_eq!(client.url(PATH_FORWARD_SINGLE), "http://10.0.0.1:7100/rpc/forward-single");
        let client = NodeClient::new("https://peer", None, Duration::from_millis(10));
        assert_eq!(client.url(PATH_DRAIN_OFFLINE), "https://peer/rpc/drain-offline");
    }

    #[test]
    fn transient_classification() {
        assert!(NodeRpcError::DeadlineExceeded.is_transient());
        assert!(NodeRpcError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(NodeRpcError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert_eq!(
            NodeRpcError::from_status(reqwest::StatusCode::UNAUTHORIZED),
            NodeRpcError::Unauthorized
        );
        assert!(!NodeRpcError::Codec("x".into()).is_transient());
    }
}
