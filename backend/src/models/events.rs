use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::RequestStatus;
use super::utxo::OutputRef;

pub const TTL_WARNING_SLOTS: u64 = 600;
pub const TTL_CRITICAL_SLOTS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RequestSigned,
    RequestExpired,
    UtxoConsumed,
    SubmissionStarted,
    SubmissionAttemptFailed,
    SubmissionSucceeded,
    SubmissionFailed,
    SubmissionCancelled,
    RequestConfirmed,
    TrackingRemoved,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::RequestSigned => "request_signed",
            AuditEventType::RequestExpired => "request_expired",
            AuditEventType::UtxoConsumed => "utxo_consumed",
            AuditEventType::SubmissionStarted => "submission_started",
            AuditEventType::SubmissionAttemptFailed => "submission_attempt_failed",
            AuditEventType::SubmissionSucceeded => "submission_succeeded",
            AuditEventType::SubmissionFailed => "submission_failed",
            AuditEventType::SubmissionCancelled => "submission_cancelled",
            AuditEventType::RequestConfirmed => "request_confirmed",
            AuditEventType::TrackingRemoved => "tracking_removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub request_id: String,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(request_id: &str, event_type: AuditEventType, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            event_type,
            details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlStatus {
    Active,
    Warning,
    Critical,
}

impl TtlStatus {
    pub fn from_remaining(remaining_slots: u64) -> Self {
        if remaining_slots <= TTL_CRITICAL_SLOTS {
            TtlStatus::Critical
        } else if remaining_slots <= TTL_WARNING_SLOTS {
            TtlStatus::Warning
        } else {
            TtlStatus::Active
        }
    }
}

/// Events pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BroadcastEvent {
    RequestUpdated {
        request_id: String,
        status: RequestStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TtlUpdate {
        request_id: String,
        current_slot: u64,
        ttl_slot: u64,
        remaining_slots: u64,
        /// One slot is one second on every supported network.
        remaining_seconds: u64,
        status: TtlStatus,
    },
    UtxoUpdate {
        request_id: String,
        checked_inputs: usize,
        consumed_inputs: Vec<OutputRef>,
    },
}

impl BroadcastEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BroadcastEvent::RequestUpdated { .. } => "request_updated",
            BroadcastEvent::TtlUpdate { .. } => "ttl_update",
            BroadcastEvent::UtxoUpdate { .. } => "utxo_update",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            BroadcastEvent::RequestUpdated { request_id, .. }
            | BroadcastEvent::TtlUpdate { request_id, .. }
            | BroadcastEvent::UtxoUpdate { request_id, .. } => request_id,
        }
    }
}
