//! Tenant policy hook client.
//!
//! Every call is gated by a per-(tenant, operation) concurrency limiter and
//! circuit breaker, signed with the tenant secret when one is known, and
//! bounded by a hard timeout. Policy overrides returned by the auth hook are
//! cached per tenant and applied to later calls.

pub mod client;
pub mod limiter;
pub mod policy;
pub mod signing;
pub mod wire;

pub use client::{AuthResult, CheckMessageResult, GroupMembersResult, HookClient, OfflineMessagesResult};
pub use limiter::HookConcurrencyLimiter;
pub use policy::{AcquirePolicy, HookPolicy, HookPolicyDefaults, TenantHookPolicyCache};
pub use signing::{compute_payload_signature, compute_signature, sign_request, verify_request};
pub use wire::{HookMeta, HookRequest, TenantRuntimeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookOperation {
    Auth,
    CheckMessage,
    GetGroupMembers,
    GetOfflineMessages,
}

impl HookOperation {
    pub fn label(&self) -> &'static str {
        match self {
            HookOperation::Auth => "auth",
            HookOperation::CheckMessage => "check_message",
            HookOperation::GetGroupMembers => "get_group_members",
            HookOperation::GetOfflineMessages => "get_offline_messages",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            HookOperation::Auth => "/auth",
            HookOperation::CheckMessage => "/check-message",
            HookOperation::GetGroupMembers => "/get-group-members",
            HookOperation::GetOfflineMessages => "/get-offline-messages",
        }
    }
}
