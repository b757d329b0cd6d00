use super::limiter::HookConcurrencyLimiter;
use super::policy::{AcquirePolicy, HookPolicy, TenantHookPolicyCache};
use super::signing::sign_request;
use super::wire::{
    AuthRequest, AuthResponse, CheckMessageRequest, CheckMessageResponse, GetGroupMembersRequest,
    GetGroupMembersResponse, GetOfflineMessagesRequest, GetOfflineMessagesResponse, HookMeta,
    HookRequest, TenantRuntimeConfig,
};
use super::HookOperation;
use crate::forwarding::CircuitBreaker;
use crate::messaging::MessageRequest;
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const HOOK_CONTENT_TYPE: &str = "application/octet-stream";
const LOG_INTERVAL_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub user_id: String,
    pub device_id: String,
    pub config: Option<TenantRuntimeConfig>,
    pub reason: String,
}

impl AuthResult {
    fn denied(reason: &str) -> Self {
        Self {
            ok: false,
            user_id: String::new(),
            device_id: String::new(),
            config: None,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckMessageResult {
    pub allow: bool,
    /// The hook could not be consulted; `allow` is the configured fallback.
    pub degraded: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembersResult {
    pub ok: bool,
    pub degraded: bool,
    pub reason: String,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfflineMessagesResult {
    pub ok: bool,
    pub degraded: bool,
    pub messages: Vec<MessageRequest>,
    pub has_more: bool,
    pub next_cursor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostOutcome {
    Ok,
    QueueRejected,
    Timeout,
    Http4xx,
    Http5xx,
    HttpOther,
    NetworkError,
    DecodeError,
}

impl PostOutcome {
    fn label(self) -> &'static str {
        match self {
            PostOutcome::Ok => "ok",
            PostOutcome::QueueRejected => "queue_rejected",
            PostOutcome::Timeout => "timeout",
            PostOutcome::Http4xx => "http_4xx",
            PostOutcome::Http5xx => "http_5xx",
            PostOutcome::HttpOther => "http_other",
            PostOutcome::NetworkError => "network_error",
            PostOutcome::DecodeError => "decode_error",
        }
    }

    /// Local back-pressure is not the hook's fault.
    fn counts_for_breaker(self) -> bool {
        !matches!(self, PostOutcome::Ok | PostOutcome::QueueRejected)
    }
}

/// Why a hook call produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallFailure {
    CircuitOpen,
    SignRequired,
    Post(PostOutcome),
}

impl CallFailure {
    fn reason(self) -> &'static str {
        match self {
            CallFailure::CircuitOpen => "hook circuit open",
            CallFailure::SignRequired => "hook sign required",
            CallFailure::Post(PostOutcome::QueueRejected) => "hook queue rejected",
            CallFailure::Post(_) => "hook timeout/failure",
        }
    }

    /// A missing signature is a configuration error, not an outage.
    fn degraded(self) -> bool {
        !matches!(self, CallFailure::SignRequired)
    }
}

/// Resilient caller of tenant policy hooks.
pub struct HookClient<C: Clock> {
    http: reqwest::Client,
    clock: C,
    breaker: CircuitBreaker<(String, HookOperation), C>,
    policies: TenantHookPolicyCache,
    limiter: HookConcurrencyLimiter,
    auth_secrets: HashMap<String, String>,
    metrics: Arc<MetricsRegistry>,
    check_message_fail_open: bool,
    last_logged: DashMap<(String, HookOperation, &'static str), i64>,
}

impl<C: Clock> HookClient<C> {
    pub fn new(
        timeout: Duration,
        policies: TenantHookPolicyCache,
        auth_secrets: HashMap<String, String>,
        check_message_fail_open: bool,
        clock: C,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!("failed to build hook client: {err:?}");
                reqwest::Client::new()
            });
        Self {
            http,
            breaker: CircuitBreaker::new(clock.clone()),
            clock,
            policies,
            limiter: HookConcurrencyLimiter::new(metrics.clone()),
            auth_secrets: auth_secrets
                .into_iter()
                .filter(|(_, secret)| !secret.trim().is_empty())
                .collect(),
            metrics,
            check_message_fail_open,
            last_logged: DashMap::new(),
        }
    }

    pub fn policies(&self) -> &TenantHookPolicyCache {
        &self.policies
    }

    fn meta(&self, tenant_id: &str, trace_id: &str) -> HookMeta {
        HookMeta::new(tenant_id, self.clock.unix_millis(), trace_id)
    }

    /// Authenticate a connecting client. Fails closed.
    pub async fn auth(
        &self,
        auth_url: &str,
        tenant_id: &str,
        token: &str,
        device_id: &str,
        trace_id: &str,
    ) -> AuthResult {
        let policy = self.policies.get(tenant_id);
        let request = AuthRequest {
            meta: self.meta(tenant_id, trace_id),
            token: token.to_string(),
            device_id: device_id.to_string(),
        };
        let secret = self.auth_secrets.get(tenant_id).map(String::as_str);
        match self
            .call::<_, AuthResponse>(tenant_id, HookOperation::Auth, auth_url, policy, secret, request)
            .await
        {
            Ok(response) => {
                if response.ok {
                    if let Some(config) = &response.config {
                        self.policies.update(tenant_id, config);
                    }
                }
                AuthResult {
                    ok: response.ok,
                    user_id: response.user_id,
                    device_id: response.device_id,
                    config: response.config,
                    reason: response.reason,
                }
            }
            Err(CallFailure::CircuitOpen) => AuthResult::denied("auth hook circuit open"),
            Err(CallFailure::SignRequired) => AuthResult::denied("auth hook sign required"),
            Err(failure) => AuthResult::denied(failure.reason()),
        }
    }

    /// Ask whether a message may be sent. Unreachable hooks deny unless the
    /// node opted into `check_message_fail_open`.
    pub async fn check_message(
        &self,
        tenant: &TenantRuntimeConfig,
        tenant_id: &str,
        message: &MessageRequest,
        trace_id: &str,
    ) -> CheckMessageResult {
        let policy = self.policies.resolve(tenant_id, tenant);
        let request = CheckMessageRequest {
            meta: self.meta(tenant_id, trace_id),
            message: message.clone(),
        };
        match self
            .call::<_, CheckMessageResponse>(
                tenant_id,
                HookOperation::CheckMessage,
                &tenant.hook_base_url,
                policy,
                tenant.tenant_secret(),
                request,
            )
            .await
        {
            Ok(response) => CheckMessageResult {
                allow: response.allow,
                degraded: false,
                reason: response.reason,
            },
            Err(failure) => CheckMessageResult {
                allow: failure.degraded() && self.check_message_fail_open,
                degraded: failure.degraded(),
                reason: failure.reason().to_string(),
            },
        }
    }

    pub async fn group_members(
        &self,
        tenant: &TenantRuntimeConfig,
        tenant_id: &str,
        group_id: &str,
        trace_id: &str,
    ) -> GroupMembersResult {
        let policy = self.policies.resolve(tenant_id, tenant);
        let request = GetGroupMembersRequest {
            meta: self.meta(tenant_id, trace_id),
            group_id: group_id.to_string(),
        };
        match self
            .call::<_, GetGroupMembersResponse>(
                tenant_id,
                HookOperation::GetGroupMembers,
                &tenant.hook_base_url,
                policy,
                tenant.tenant_secret(),
                request,
            )
            .await
        {
            Ok(response) => GroupMembersResult {
                ok: true,
                degraded: false,
                reason: String::new(),
                user_ids: response.user_ids,
            },
            Err(failure) => GroupMembersResult {
                ok: false,
                degraded: failure.degraded(),
                reason: failure.reason().to_string(),
                user_ids: Vec::new(),
            },
        }
    }

    /// One page of hook-held offline messages. Failures yield an empty page.
    #[allow(clippy::too_many_arguments)]
    pub async fn offline_messages(
        &self,
        tenant: &TenantRuntimeConfig,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        max_messages: u32,
        cursor: &str,
        trace_id: &str,
    ) -> OfflineMessagesResult {
        let policy = self.policies.resolve(tenant_id, tenant);
        let request = GetOfflineMessagesRequest {
            meta: self.meta(tenant_id, trace_id),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            max_messages,
            cursor: cursor.to_string(),
        };
        match self
            .call::<_, GetOfflineMessagesResponse>(
                tenant_id,
                HookOperation::GetOfflineMessages,
                &tenant.hook_base_url,
                policy,
                tenant.tenant_secret(),
                request,
            )
            .await
        {
            Ok(response) => OfflineMessagesResult {
                ok: true,
                degraded: false,
                messages: response.messages,
                has_more: response.has_more,
                next_cursor: response.next_cursor,
            },
            Err(failure) => OfflineMessagesResult {
                degraded: failure.degraded(),
                ..OfflineMessagesResult::default()
            },
        }
    }

    async fn call<Req, Resp>(
        &self,
        tenant_id: &str,
        op: HookOperation,
        base_url: &str,
        policy: HookPolicy,
        secret: Option<&str>,
        mut request: Req,
    ) -> Result<Resp, CallFailure>
    where
        Req: HookRequest,
        Resp: DeserializeOwned,
    {
        let key = (tenant_id.to_string(), op);
        let url = format!("{}{}", base_url.trim_end_matches('/'), op.path());
        let Some(attempt) = self.breaker.begin(&key) else {
            self.metrics.counter_inc(
                "courier_hook_breaker_open_total",
                1,
                &[("tenant", tenant_id), ("op", op.label())],
            );
            self.log_failure(tenant_id, op, "circuit_open", &url, "");
            return Err(CallFailure::CircuitOpen);
        };

        match secret {
            Some(secret) => {
                if let Err(err) = sign_request(secret, &mut request) {
                    tracing::warn!(tenant = tenant_id, op = op.label(), "hook sign failed: {err}");
                    return Err(CallFailure::SignRequired);
                }
            }
            None if policy.sign_required => {
                self.log_failure(tenant_id, op, "sign_required", &url, &request.meta().request_id);
                attempt.fail(policy.breaker);
                return Err(CallFailure::SignRequired);
            }
            None => {}
        }

        let request_id = request.meta().request_id.clone();
        let (outcome, response) = self.post::<_, Resp>(&url, tenant_id, op, policy.acquire, &request).await;
        match response {
            Some(response) => {
                attempt.succeed();
                Ok(response)
            }
            None => {
                if outcome.counts_for_breaker() && attempt.fail(policy.breaker) {
                    tracing::warn!(tenant = tenant_id, op = op.label(), "hook breaker opened");
                }
                self.log_failure(tenant_id, op, outcome.label(), &url, &request_id);
                Err(CallFailure::Post(outcome))
            }
        }
    }

    async fn post<Req, Resp>(
        &self,
        url: &str,
        tenant_id: &str,
        op: HookOperation,
        acquire: AcquirePolicy,
        request: &Req,
    ) -> (PostOutcome, Option<Resp>)
    where
        Req: HookRequest,
        Resp: DeserializeOwned,
    {
        let Some(_permit) = self.limiter.acquire(tenant_id, op, acquire).await else {
            self.record(tenant_id, op, PostOutcome::QueueRejected);
            return (PostOutcome::QueueRejected, None);
        };
        let body = match bincode::serialize(request) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(tenant = tenant_id, op = op.label(), "hook encode failed: {err}");
                self.record(tenant_id, op, PostOutcome::DecodeError);
                return (PostOutcome::DecodeError, None);
            }
        };

        let started = self.clock.now();
        let (outcome, response) = self.exchange::<Resp>(url, body).await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.metrics.histogram_observe(
            "courier_hook_duration_ms",
            elapsed.as_secs_f64() * 1000.0,
            &[("tenant", tenant_id), ("op", op.label())],
        );
        self.record(tenant_id, op, outcome);
        (outcome, response)
    }

    async fn exchange<Resp: DeserializeOwned>(&self, url: &str, body: Vec<u8>) -> (PostOutcome, Option<Resp>) {
        let response = match self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, HOOK_CONTENT_TYPE)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return (PostOutcome::Timeout, None),
            Err(_) => return (PostOutcome::NetworkError, None),
        };
        let status = response.status();
        if !status.is_success() {
            let outcome = match status.as_u16() / 100 {
                4 => PostOutcome::Http4xx,
                5 => PostOutcome::Http5xx,
                _ => PostOutcome::HttpOther,
            };
            return (outcome, None);
        }
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) if err.is_timeout() => return (PostOutcome::Timeout, None),
            Err(_) => return (PostOutcome::NetworkError, None),
        };
        match bincode::deserialize::<Resp>(&bytes) {
            Ok(parsed) => (PostOutcome::Ok, Some(parsed)),
            Err(_) => (PostOutcome::DecodeError, None),
        }
    }

    fn record(&self, tenant_id: &str, op: HookOperation, outcome: PostOutcome) {
        self.metrics.counter_inc(
            "courier_hook_requests_total",
            1,
            &[("tenant", tenant_id), ("op", op.label()), ("result", outcome.label())],
        );
    }

    /// Metadata only; bodies, headers and signatures stay out of logs.
    fn log_failure(&self, tenant_id: &str, op: HookOperation, result: &'static str, url: &str, request_id: &str) {
        if !self.should_log(tenant_id, op, result) {
            return;
        }
        tracing::warn!(
            tenant = tenant_id,
            op = op.label(),
            result,
            url,
            request_id,
            "hook request failed"
        );
    }

    fn should_log(&self, tenant_id: &str, op: HookOperation, result: &'static str) -> bool {
        let now = self.clock.unix_millis();
        let mut last = self
            .last_logged
            .entry((tenant_id.to_string(), op, result))
            .or_insert(i64::MIN);
        if *last != i64::MIN && now - *last < LOG_INTERVAL_MS {
            return false;
        }
        *last = now;
        true
    }
}
