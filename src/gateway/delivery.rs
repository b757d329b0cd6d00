//! Single-chat and group-chat delivery, plus the offline drain run on connect.

use super::Gateway;
use crate::cluster::{NodeInfo, OnlineDeviceRoute, StoreError, UserRoutes};
use crate::connections::ConnectionSession;
use crate::forwarding::{build_buckets, unrouted_members};
use crate::messaging::{encode_delivery, MessageRequest};
use crate::time::Clock;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

const OFFLINE_PULL_PAGE: u32 = 100;
const OFFLINE_PULL_MAX_PAGES: usize = 10;
const OFFLINE_PULL_MAX_TOTAL: u32 = 1_000;
/// Route chunks fetched ahead of the one being processed.
const ROUTE_PREFETCH: usize = 2;

/// Outcome of one delivery attempt as reported in the sender's ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub ok: bool,
    pub reason: String,
    /// False when the message was stopped before any recipient was tried
    /// (policy deny, member lookup failure, store error).
    pub attempted: bool,
}

impl Delivery {
    fn delivered() -> Self {
        Self {
            ok: true,
            reason: String::new(),
            attempted: true,
        }
    }

    /// Recipients were tried and none took the message.
    fn undelivered(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            attempted: true,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            attempted: false,
        }
    }
}

/// How an offline recipient was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parked {
    Notified,
    Buffered,
    Skipped,
}

impl<C: Clock> Gateway<C> {
    /// Device routes for a user, cache first.
    async fn user_routes(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Arc<UserRoutes>, StoreError> {
        if let Some(hit) = self.route_cache.get(tenant_id, user_id) {
            return Ok(hit);
        }
        let routes = Arc::new(self.routes.get_user(tenant_id, user_id).await?);
        self.route_cache.set(tenant_id, user_id, routes.clone());
        Ok(routes)
    }

    pub(super) async fn deliver_single(
        &self,
        session: &ConnectionSession,
        message: &MessageRequest,
    ) -> Delivery {
        let tenant = session.tenant_id.as_str();
        let to_user = message.to_user_id.as_str();
        let (check, routes) = tokio::join!(
            self.hooks
                .check_message(&session.tenant_config, tenant, message, &session.trace_id),
            self.user_routes(tenant, to_user),
        );
        self.count_check(tenant, check.degraded, check.allow);
        if !check.allow {
            return Delivery::failed(check.reason);
        }
        let routes = match routes {
            Ok(routes) => routes,
            Err(err) => {
                tracing::warn!(tenant, to = to_user, "route lookup failed: {err}");
                return Delivery::failed("route lookup failed");
            }
        };
        let frame = match encode_delivery(message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(tenant, "delivery encode failed: {err}");
                return Delivery::failed("internal error");
            }
        };

        if routes.is_empty() {
            return match self.park_offline(session, message, to_user, &frame, true).await {
                Parked::Skipped => Delivery::undelivered("offline buffer full"),
                _ => Delivery::delivered(),
            };
        }

        // node id -> endpoint
        let mut nodes: BTreeMap<&str, &str> = BTreeMap::new();
        for route in routes.values() {
            nodes.entry(route.node_id.as_str()).or_insert(route.endpoint.as_str());
        }
        let mut delivered_any = false;
        let mut failed = 0usize;
        for (node_id, endpoint) in nodes {
            if node_id == self.node.node_id {
                delivered_any |= self.deliver_local(tenant, to_user, &frame, "local") > 0;
                continue;
            }
            let node = NodeInfo::new(node_id, endpoint);
            if self.forwarder.forward_single(&node, to_user, message).await {
                delivered_any = true;
                continue;
            }
            match self.park_offline(session, message, to_user, &frame, true).await {
                Parked::Skipped => failed += 1,
                _ => delivered_any = true,
            }
        }
        if delivered_any {
            Delivery::delivered()
        } else if failed > 0 {
            Delivery::undelivered("delivery failed")
        } else {
            Delivery::undelivered("no routes delivered")
        }
    }

    pub(super) async fn deliver_group(
        &self,
        session: &ConnectionSession,
        message: &MessageRequest,
    ) -> Delivery {
        let tenant = session.tenant_id.as_str();
        let cfg = &session.tenant_config;
        let (check, members) = tokio::join!(
            self.hooks
                .check_message(cfg, tenant, message, &session.trace_id),
            self.hooks
                .group_members(cfg, tenant, &message.group_id, &session.trace_id),
        );
        self.count_check(tenant, check.degraded, check.allow);
        if !check.allow {
            return Delivery::failed(check.reason);
        }
        let members_result = if members.degraded {
            "degraded"
        } else if members.ok {
            "ok"
        } else {
            "fail"
        };
        self.metrics.counter_inc(
            "courier_hook_get_group_members_total",
            1,
            &[("tenant", tenant), ("result", members_result)],
        );
        if !members.ok {
            return Delivery::failed(members.reason);
        }
        self.metrics
            .counter_inc("courier_group_messages_total", 1, &[("tenant", tenant)]);

        let mut seen = HashSet::with_capacity(members.user_ids.len());
        let mut distinct: Vec<String> = members
            .user_ids
            .into_iter()
            .filter(|u| !u.trim().is_empty())
            .filter(|u| seen.insert(u.clone()))
            .collect();
        let cap = self.limits.group_members_max_users.max(1);
        if distinct.len() > cap {
            self.metrics.counter_inc(
                "courier_group_members_capped_total",
                (distinct.len() - cap) as u64,
                &[("tenant", tenant)],
            );
            distinct.truncate(cap);
        }
        if distinct.is_empty() {
            return Delivery::undelivered("group members empty");
        }
        self.metrics.counter_inc(
            "courier_group_members_total",
            distinct.len() as u64,
            &[("tenant", tenant)],
        );

        let routes = match self.group_routes(tenant, &distinct).await {
            Ok(routes) => routes,
            Err(err) => {
                tracing::warn!(tenant, group = %message.group_id, "group route lookup failed: {err}");
                return Delivery::failed("route lookup failed");
            }
        };
        let frame = match encode_delivery(message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(tenant, "delivery encode failed: {err}");
                return Delivery::failed("internal error");
            }
        };

        let mut fanout = GroupOffline::new(self.limits.group_offline_buffer_max_users);
        let mut delivered_any = false;
        for user in unrouted_members(&distinct, &routes) {
            delivered_any |= fanout
                .park(self, session, message, user, &frame)
                .await;
        }

        let buckets = build_buckets(&self.node.node_id, &distinct, &routes);
        self.metrics.counter_inc(
            "courier_group_fanout_nodes_total",
            buckets.len() as u64,
            &[("tenant", tenant)],
        );
        for bucket in &buckets {
            if bucket.node_id == self.node.node_id {
                for user in &bucket.user_ids {
                    delivered_any |= self.deliver_local(tenant, user, &frame, "local_group") > 0;
                }
                continue;
            }
            let node = NodeInfo::new(bucket.node_id.clone(), bucket.endpoint.clone());
            if self
                .forwarder
                .forward_batch(&node, &bucket.user_ids, message)
                .await
            {
                delivered_any = true;
                continue;
            }
            for user in &bucket.user_ids {
                delivered_any |= fanout
                    .park(self, session, message, user, &frame)
                    .await;
            }
        }
        fanout.report(self, tenant);

        if delivered_any {
            Delivery::delivered()
        } else {
            Delivery::undelivered("delivery failed")
        }
    }

    /// Routes for every member, fetched in chunks with a small prefetch window.
    async fn group_routes(
        &self,
        tenant_id: &str,
        members: &[String],
    ) -> Result<HashMap<String, Vec<OnlineDeviceRoute>>, StoreError> {
        let chunk = self.limits.group_route_chunk_size.clamp(1, 4096);
        let mut lookups = stream::iter(members.chunks(chunk))
            .map(|users| self.routes.get_users(tenant_id, users))
            .buffered(ROUTE_PREFETCH);
        let mut all = HashMap::with_capacity(members.len());
        while let Some(found) = lookups.next().await {
            all.extend(found?);
        }
        Ok(all)
    }

    fn deliver_local(&self, tenant_id: &str, user_id: &str, frame: &Bytes, via: &str) -> usize {
        let sent = self.registry.send_to_user(tenant_id, user_id, frame);
        if sent > 0 {
            self.metrics.counter_inc(
                "courier_deliveries_total",
                sent as u64,
                &[("tenant", tenant_id), ("via", via)],
            );
        }
        sent
    }

    /// Announce to the hook when the tenant pulls offline messages, otherwise
    /// buffer at the recipient's home node when `may_buffer` allows it.
    async fn park_offline(
        &self,
        session: &ConnectionSession,
        message: &MessageRequest,
        to_user_id: &str,
        frame: &Bytes,
        may_buffer: bool,
    ) -> Parked {
        let tenant = session.tenant_id.as_str();
        let cfg = &session.tenant_config;
        if cfg.offline_use_hook_pull {
            let event = self.factory.offline_message_for(
                message,
                to_user_id,
                &session.trace_id,
                self.clock.unix_millis(),
                cfg.tenant_secret(),
            );
            if self.events.try_enqueue(event) {
                self.metrics
                    .counter_inc("courier_offline_notified_total", 1, &[("tenant", tenant)]);
                return Parked::Notified;
            }
        }
        if may_buffer
            && self
                .offline
                .buffer(tenant, to_user_id, frame.clone(), cfg.offline_ttl())
                .await
        {
            Parked::Buffered
        } else {
            Parked::Skipped
        }
    }

    fn count_check(&self, tenant_id: &str, degraded: bool, allow: bool) {
        let result = if degraded {
            "degraded"
        } else if allow {
            "allow"
        } else {
            "deny"
        };
        self.metrics.counter_inc(
            "courier_hook_check_message_total",
            1,
            &[("tenant", tenant_id), ("result", result)],
        );
    }

    /// Push pending messages to a freshly connected session: hook-held
    /// messages first when the tenant pulls, then the home-node buffer.
    pub(super) async fn drain_offline_to(&self, session: &ConnectionSession) {
        if session.tenant_config.offline_use_hook_pull {
            self.pull_hook_offline(session).await;
        }
        let frames = self
            .offline
            .drain(&session.tenant_id, &session.user_id)
            .await;
        for frame in frames {
            if !session.socket.try_send_frame(frame) {
                self.metrics.counter_inc(
                    "courier_frames_dropped_total",
                    1,
                    &[("tenant", &session.tenant_id)],
                );
                break;
            }
        }
    }

    async fn pull_hook_offline(&self, session: &ConnectionSession) {
        let tenant = session.tenant_id.as_str();
        let mut cursor = String::new();
        let mut pulled = 0u32;
        for _ in 0..OFFLINE_PULL_MAX_PAGES {
            let remaining = OFFLINE_PULL_MAX_TOTAL - pulled;
            if remaining == 0 {
                break;
            }
            let page = self
                .hooks
                .offline_messages(
                    &session.tenant_config,
                    tenant,
                    &session.user_id,
                    &session.device_id,
                    OFFLINE_PULL_PAGE.min(remaining),
                    &cursor,
                    &session.trace_id,
                )
                .await;
            if !page.ok {
                break;
            }
            for message in page.messages.iter().take(remaining as usize) {
                let Ok(frame) = encode_delivery(message) else {
                    continue;
                };
                if !session.socket.try_send_frame(frame) {
                    return;
                }
                pulled += 1;
            }
            if !page.has_more || page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        if pulled > 0 {
            self.metrics.counter_inc(
                "courier_offline_pulled_total",
                u64::from(pulled),
                &[("tenant", tenant)],
            );
        }
    }
}

/// Offline bookkeeping for one group message. Buffered recipients are capped
/// per message; hook notifications are not. A zero cap disables buffering.
struct GroupOffline {
    max_buffered: usize,
    notified: u64,
    buffered: u64,
    skipped: u64,
}

impl GroupOffline {
    fn new(max_buffered: usize) -> Self {
        Self {
            max_buffered,
            notified: 0,
            buffered: 0,
            skipped: 0,
        }
    }

    async fn park<C: Clock>(
        &mut self,
        gateway: &Gateway<C>,
        session: &ConnectionSession,
        message: &MessageRequest,
        user_id: &str,
        frame: &Bytes,
    ) -> bool {
        let may_buffer = self.buffered < self.max_buffered as u64;
        match gateway
            .park_offline(session, message, user_id, frame, may_buffer)
            .await
        {
            Parked::Notified => {
                self.notified += 1;
                true
            }
            Parked::Buffered => {
                self.buffered += 1;
                true
            }
            Parked::Skipped => {
                self.skipped += 1;
                false
            }
        }
    }

    fn report<C: Clock>(&self, gateway: &Gateway<C>, tenant_id: &str) {
        let labels = [("tenant", tenant_id)];
        for (name, value) in [
            ("courier_group_offline_notified_total", self.notified),
            ("courier_group_offline_buffered_total", self.buffered),
            ("courier_group_offline_buffer_skipped_total", self.skipped),
        ] {
            if value > 0 {
                gateway.metrics.counter_inc(name, value, &labels);
            }
        }
    }
}
