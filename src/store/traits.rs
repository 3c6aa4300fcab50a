//! Unified `Database` trait — single async interface for all persistence.
//!
//! Leads, consent records, messages, bookings, follow-ups, the cold-outreach
//! counter, and the append-only event log all go through this trait, so
//! tests run against an in-memory libsql database with no other changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::compliance::{ConsentRecord, OptOutSource};
use crate::conductor::lead::{Lead, LeadState};
use crate::error::DatabaseError;
use crate::events::EventLogEntry;

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Provider-reported delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted conversation entry.
///
/// Outbound rows exist only for provider-acknowledged sends; there is no
/// "attempted" state that could later read as a false delivery record.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub direction: MessageDirection,
    pub content: String,
    /// Stage agent that authored an outbound message.
    pub agent_id: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Booking lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// CRM reconciliation state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmSyncStatus {
    Pending,
    Synced,
    Failed,
    /// Retry ceiling reached; surfaced to the operator queue, never
    /// retried automatically again.
    Abandoned,
}

impl CrmSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// A confirmed (or cancelled) appointment.
#[derive(Debug, Clone)]
pub struct Booking {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub tenant_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: BookingStatus,
    pub technician: Option<String>,
    pub crm_sync_status: CrmSyncStatus,
    pub crm_retry_count: u32,
    pub crm_next_retry_at: Option<DateTime<Utc>>,
    pub crm_customer_id: Option<String>,
    pub crm_booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(
        lead_id: Uuid,
        tenant_id: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            lead_id,
            tenant_id: tenant_id.into(),
            window_start,
            window_end,
            status: BookingStatus::Confirmed,
            technician: None,
            crm_sync_status: CrmSyncStatus::Pending,
            crm_retry_count: 0,
            crm_next_retry_at: Some(now),
            crm_customer_id: None,
            crm_booking_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of scheduled re-contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpKind {
    /// Nudge an unresponsive lead.
    Nudge,
    /// Remind a booked lead of the appointment.
    Reminder,
}

impl FollowUpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nudge => "nudge",
            Self::Reminder => "reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nudge" => Some(Self::Nudge),
            "reminder" => Some(Self::Reminder),
            _ => None,
        }
    }
}

/// Follow-up lifecycle. `Sent` is written strictly after the provider
/// acknowledges the send — it is the "already notified" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpStatus {
    Pending,
    Sent,
    Cancelled,
    /// Re-validation at fire time found the send no longer applicable.
    Skipped,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A scheduled future re-entry into the conductor.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: FollowUpKind,
    pub due_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Look up a lead by tenant and normalized phone number.
    async fn find_lead(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Lead>, DatabaseError>;

    /// Write a new state, updating `state_entered_at`.
    async fn update_lead_state(&self, id: Uuid, state: LeadState) -> Result<(), DatabaseError>;

    /// Record the first-response timestamp if not already set.
    async fn set_first_response(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_lead_score(&self, id: Uuid, score: i64) -> Result<(), DatabaseError>;

    /// Merge contact fields captured after creation (name, email, address).
    async fn update_lead_contact(
        &self,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
        address: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Consent ─────────────────────────────────────────────────────

    /// Fetch the authoritative consent record. `None` means no opt-out has
    /// ever been recorded for this phone+tenant.
    async fn get_consent(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<ConsentRecord>, DatabaseError>;

    /// Record an opt-out. Idempotent: a second opt-out keeps the original
    /// timestamp and source.
    async fn record_opt_out(
        &self,
        tenant_id: &str,
        phone: &str,
        source: OptOutSource,
    ) -> Result<(), DatabaseError>;

    /// Explicit audited re-opt-in. Returns false if the phone was not
    /// opted out.
    async fn record_re_opt_in(
        &self,
        tenant_id: &str,
        phone: &str,
        actor: &str,
    ) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError>;

    /// Idempotently apply a provider delivery-status callback. Returns
    /// false when the message id is unknown or the status already applied.
    async fn apply_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, DatabaseError>;

    /// Number of outbound messages ever sent to a lead.
    async fn count_outbound(&self, lead_id: Uuid) -> Result<u64, DatabaseError>;

    async fn messages_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    // ── Bookings ────────────────────────────────────────────────────

    /// Insert a booking only while the tenant's local day still holds
    /// capacity, in one guarded statement. Returns false when the day is
    /// full; a second active booking for the lead is a `Constraint` error.
    async fn insert_booking(
        &self,
        booking: &Booking,
        daily_capacity: u32,
        tz_offset_minutes: i32,
    ) -> Result<bool, DatabaseError>;

    /// The single active (confirmed) booking for a lead, if any.
    async fn get_active_booking(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<Booking>, DatabaseError>;

    /// Confirmed bookings whose window overlaps `[start, end)`.
    async fn confirmed_bookings_in_range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, DatabaseError>;

    /// Bookings due for CRM sync: pending or failed, with
    /// `crm_next_retry_at <= now`. Never returns future-dated rows.
    async fn due_crm_syncs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, DatabaseError>;

    async fn mark_crm_synced(
        &self,
        id: Uuid,
        crm_customer_id: &str,
        crm_booking_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Record a failed sync attempt: bumps the retry count, pushes
    /// `crm_next_retry_at` forward, or abandons past the ceiling.
    async fn record_crm_failure(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        abandoned: bool,
    ) -> Result<(), DatabaseError>;

    /// Persist the CRM customer id created before the booking call, so a
    /// retry does not create a duplicate customer.
    async fn set_crm_customer_id(
        &self,
        id: Uuid,
        crm_customer_id: &str,
    ) -> Result<(), DatabaseError>;

    // ── Follow-ups ──────────────────────────────────────────────────

    async fn schedule_followup(
        &self,
        lead_id: Uuid,
        kind: FollowUpKind,
        due_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    /// Pending follow-ups with `due_at <= now`.
    async fn due_followups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FollowUp>, DatabaseError>;

    async fn get_followup(&self, id: Uuid) -> Result<Option<FollowUp>, DatabaseError>;

    /// Mark a follow-up sent. Called strictly after provider ack.
    async fn mark_followup_sent(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn mark_followup_skipped(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Cancel all pending follow-ups for a lead. Returns how many.
    async fn cancel_pending_followups(&self, lead_id: Uuid) -> Result<usize, DatabaseError>;

    // ── Cold-outreach counter ───────────────────────────────────────

    /// Atomically reserve one cold send if the counter is below `cap`.
    /// Compare-and-increment: two racing callers can never both succeed
    /// at cap-1.
    async fn reserve_cold_slot(&self, lead_id: Uuid, cap: u32) -> Result<bool, DatabaseError>;

    /// Return a reserved slot after a failed send.
    async fn release_cold_slot(&self, lead_id: Uuid) -> Result<(), DatabaseError>;

    async fn cold_count(&self, lead_id: Uuid) -> Result<u32, DatabaseError>;

    // ── Event log ───────────────────────────────────────────────────

    /// Append an audit entry. Entries are never mutated.
    async fn append_event(&self, entry: &EventLogEntry) -> Result<(), DatabaseError>;

    async fn events_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, DatabaseError>;
}
