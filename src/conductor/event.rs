//! Normalized lead events.
//!
//! Every intake source and every timer funnels into `LeadEvent` — the single
//! shape `Conductor::handle_event` accepts.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::lead::LeadSource;

/// A normalized event concerning one lead.
#[derive(Debug, Clone)]
pub enum LeadEvent {
    /// A brand-new or repeat intake submission (form, paid platform,
    /// missed call).
    Intake {
        source: LeadSource,
        name: Option<String>,
        email: Option<String>,
        address: Option<String>,
        /// Job description or form notes, if the source carried any.
        notes: Option<String>,
    },
    /// An inbound SMS reply from the lead.
    InboundSms { body: String, received_at: DateTime<Utc> },
    /// A scheduled follow-up nudge came due.
    FollowUpDue { followup_id: Uuid },
    /// A booking reminder came due.
    ReminderDue { followup_id: Uuid },
    /// The scheduling flow confirmed an appointment window.
    BookingConfirmed {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },
    /// An administrative action from the dashboard API.
    Admin(AdminAction),
}

/// Administrative actions. A raw state write to `opted_out` is rejected;
/// the dedicated `OptOut` action exists instead, and it runs the same
/// pipeline as a STOP reply (consent record, follow-up cancellation,
/// audit entry).
#[derive(Debug, Clone)]
pub enum AdminAction {
    /// Force a state write. Rejected when the target is `opted_out`.
    SetState { state: super::lead::LeadState },
    /// Revoke consent on the lead's behalf (phoned-in request, complaint).
    OptOut,
    /// Audited re-opt-in after fresh consent was collected out of band.
    ReOptIn { actor: String },
    /// Mark the job completed.
    MarkCompleted,
}

impl LeadEvent {
    /// Short label for logging and audit entries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Intake { .. } => "intake",
            Self::InboundSms { .. } => "inbound_sms",
            Self::FollowUpDue { .. } => "followup_due",
            Self::ReminderDue { .. } => "reminder_due",
            Self::BookingConfirmed { .. } => "booking_confirmed",
            Self::Admin(AdminAction::SetState { .. }) => "admin_set_state",
            Self::Admin(AdminAction::OptOut) => "admin_opt_out",
            Self::Admin(AdminAction::ReOptIn { .. }) => "admin_re_opt_in",
            Self::Admin(AdminAction::MarkCompleted) => "admin_mark_completed",
        }
    }

    /// Whether this event was triggered by the lead contacting us.
    ///
    /// Sends triggered by inbound events are replies and exempt from the
    /// cold-outreach cap; everything else counts against it.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::InboundSms { .. })
    }
}
