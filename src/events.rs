//! Append-only event log.
//!
//! Every compliance decision, state transition, and external-system
//! interaction lands here with duration and cost where applicable. Entries
//! are never mutated; the dashboard's activity feed reads them as-is.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LeadCreated,
    StateTransition,
    ComplianceDecision,
    OptOut,
    ReOptIn,
    MessageSent,
    DeliveryStatus,
    BookingCreated,
    CrmSyncOutcome,
    FollowUpScheduled,
    FollowUpSkipped,
    WebhookRejected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::StateTransition => "state_transition",
            Self::ComplianceDecision => "compliance_decision",
            Self::OptOut => "opt_out",
            Self::ReOptIn => "re_opt_in",
            Self::MessageSent => "message_sent",
            Self::DeliveryStatus => "delivery_status",
            Self::BookingCreated => "booking_created",
            Self::CrmSyncOutcome => "crm_sync_outcome",
            Self::FollowUpScheduled => "followup_scheduled",
            Self::FollowUpSkipped => "followup_skipped",
            Self::WebhookRejected => "webhook_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "lead_created" => Self::LeadCreated,
            "state_transition" => Self::StateTransition,
            "compliance_decision" => Self::ComplianceDecision,
            "opt_out" => Self::OptOut,
            "re_opt_in" => Self::ReOptIn,
            "message_sent" => Self::MessageSent,
            "delivery_status" => Self::DeliveryStatus,
            "booking_created" => Self::BookingCreated,
            "crm_sync_outcome" => Self::CrmSyncOutcome,
            "followup_scheduled" => Self::FollowUpScheduled,
            "followup_skipped" => Self::FollowUpSkipped,
            "webhook_rejected" => Self::WebhookRejected,
            _ => return None,
        })
    }
}

/// One append-only audit record.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub lead_id: Option<Uuid>,
    pub kind: EventKind,
    /// Human-readable detail for the operator feed. Never shown to leads.
    pub detail: String,
    pub duration_ms: Option<i64>,
    pub cost: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn new(tenant_id: impl Into<String>, kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            lead_id: None,
            kind,
            detail: detail.into(),
            duration_ms: None,
            cost: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }

    pub fn with_duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = Some(cost);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_optional_fields() {
        let entry = EventLogEntry::new("t1", EventKind::ComplianceDecision, "blocked: quiet hours")
            .for_lead(Uuid::new_v4())
            .with_duration_ms(12)
            .with_cost(Decimal::new(42, 4));
        assert!(entry.lead_id.is_some());
        assert_eq!(entry.duration_ms, Some(12));
        assert_eq!(entry.cost, Some(Decimal::new(42, 4)));
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            EventKind::LeadCreated,
            EventKind::StateTransition,
            EventKind::ComplianceDecision,
            EventKind::OptOut,
            EventKind::ReOptIn,
            EventKind::MessageSent,
            EventKind::DeliveryStatus,
            EventKind::BookingCreated,
            EventKind::CrmSyncOutcome,
            EventKind::FollowUpScheduled,
            EventKind::FollowUpSkipped,
            EventKind::WebhookRejected,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
