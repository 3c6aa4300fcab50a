//! Lead model and conversation state machine.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a lead entered the funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    WebForm,
    LeadAds,
    MissedCall,
    SmsReply,
    Other,
}

impl LeadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebForm => "web_form",
            Self::LeadAds => "lead_ads",
            Self::MissedCall => "missed_call",
            Self::SmsReply => "sms_reply",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "web_form" => Self::WebForm,
            "lead_ads" => Self::LeadAds,
            "missed_call" => Self::MissedCall,
            "sms_reply" => Self::SmsReply,
            _ => Self::Other,
        }
    }
}

/// Conversation stage of a lead.
///
/// Main path: `New → IntakeSent → Qualifying → Qualified → Booking →
/// Booked → Completed`. Side states: `Cold` (response timeout, revivable),
/// `Dead` (outreach exhausted, revivable only by an inbound reply), and
/// `OptedOut` (terminal, reachable from any non-terminal state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadState {
    New,
    IntakeSent,
    Qualifying,
    Qualified,
    Booking,
    Booked,
    Completed,
    Cold,
    Dead,
    OptedOut,
}

impl LeadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::IntakeSent => "intake_sent",
            Self::Qualifying => "qualifying",
            Self::Qualified => "qualified",
            Self::Booking => "booking",
            Self::Booked => "booked",
            Self::Completed => "completed",
            Self::Cold => "cold",
            Self::Dead => "dead",
            Self::OptedOut => "opted_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new" => Self::New,
            "intake_sent" => Self::IntakeSent,
            "qualifying" => Self::Qualifying,
            "qualified" => Self::Qualified,
            "booking" => Self::Booking,
            "booked" => Self::Booked,
            "completed" => Self::Completed,
            "cold" => Self::Cold,
            "dead" => Self::Dead,
            "opted_out" => Self::OptedOut,
            _ => return None,
        })
    }

    /// Terminal states accept no further transitions (except none at all).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OptedOut)
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(&self, to: LeadState) -> bool {
        if *self == to {
            return false;
        }
        // Opt-out is reachable from every non-terminal state.
        if to == Self::OptedOut {
            return !self.is_terminal();
        }
        match self {
            Self::New => matches!(to, Self::IntakeSent | Self::Cold | Self::Dead),
            Self::IntakeSent => matches!(to, Self::Qualifying | Self::Cold | Self::Dead),
            Self::Qualifying => matches!(to, Self::Qualified | Self::Cold | Self::Dead),
            Self::Qualified => matches!(to, Self::Booking | Self::Cold | Self::Dead),
            Self::Booking => matches!(to, Self::Booked | Self::Cold | Self::Dead),
            Self::Booked => matches!(to, Self::Completed),
            Self::Completed => false,
            // A reply revives a cold or dead lead back into qualification.
            Self::Cold => matches!(to, Self::Qualifying | Self::Dead),
            Self::Dead => matches!(to, Self::Qualifying),
            Self::OptedOut => false,
        }
    }
}

/// An inbound home-service lead. Created on the first event for an unseen
/// phone+tenant pair, mutated only by the conductor, never deleted.
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub source: LeadSource,
    pub state: LeadState,
    pub score: Option<i64>,
    /// UTC offset of the lead's local timezone, in minutes.
    pub tz_offset_minutes: i32,
    pub first_response_at: Option<DateTime<Utc>>,
    pub state_entered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        tenant_id: impl Into<String>,
        phone: impl Into<String>,
        source: LeadSource,
        tz_offset_minutes: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            phone: phone.into(),
            name: None,
            email: None,
            address: None,
            source,
            state: LeadState::New,
            score: None,
            tz_offset_minutes,
            first_response_at: None,
            state_entered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// The lead's local timezone as a fixed offset.
    ///
    /// Falls back to UTC if the stored offset is out of range (corrupt row);
    /// UTC is the conservative choice for quiet-hours math.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.tz_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opted_out_reachable_from_all_non_terminal_states() {
        for state in [
            LeadState::New,
            LeadState::IntakeSent,
            LeadState::Qualifying,
            LeadState::Qualified,
            LeadState::Booking,
            LeadState::Booked,
            LeadState::Completed,
            LeadState::Cold,
            LeadState::Dead,
        ] {
            assert!(
                state.can_transition(LeadState::OptedOut),
                "{state:?} should allow opt-out"
            );
        }
    }

    #[test]
    fn opted_out_is_terminal() {
        assert!(LeadState::OptedOut.is_terminal());
        for state in [
            LeadState::New,
            LeadState::Qualifying,
            LeadState::Booked,
            LeadState::Cold,
        ] {
            assert!(!LeadState::OptedOut.can_transition(state));
        }
    }

    #[test]
    fn main_path_transitions() {
        assert!(LeadState::New.can_transition(LeadState::IntakeSent));
        assert!(LeadState::IntakeSent.can_transition(LeadState::Qualifying));
        assert!(LeadState::Qualifying.can_transition(LeadState::Qualified));
        assert!(LeadState::Qualified.can_transition(LeadState::Booking));
        assert!(LeadState::Booking.can_transition(LeadState::Booked));
        assert!(LeadState::Booked.can_transition(LeadState::Completed));
    }

    #[test]
    fn no_skipping_stages() {
        assert!(!LeadState::New.can_transition(LeadState::Booked));
        assert!(!LeadState::IntakeSent.can_transition(LeadState::Booking));
        assert!(!LeadState::Booked.can_transition(LeadState::Qualifying));
    }

    #[test]
    fn cold_and_dead_revive_into_qualifying() {
        assert!(LeadState::Cold.can_transition(LeadState::Qualifying));
        assert!(LeadState::Dead.can_transition(LeadState::Qualifying));
        assert!(!LeadState::Dead.can_transition(LeadState::Booked));
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            LeadState::New,
            LeadState::IntakeSent,
            LeadState::Qualifying,
            LeadState::Qualified,
            LeadState::Booking,
            LeadState::Booked,
            LeadState::Completed,
            LeadState::Cold,
            LeadState::Dead,
            LeadState::OptedOut,
        ] {
            assert_eq!(LeadState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LeadState::parse("bogus"), None);
    }

    #[test]
    fn local_offset_falls_back_to_utc_on_corrupt_value() {
        let mut lead = Lead::new("t1", "+15551230000", LeadSource::WebForm, -300);
        assert_eq!(lead.local_offset().local_minus_utc(), -300 * 60);
        lead.tz_offset_minutes = 100_000;
        assert_eq!(lead.local_offset().local_minus_utc(), 0);
    }
}
