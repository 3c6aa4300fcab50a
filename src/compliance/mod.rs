//! Compliance engine — the consent gate in front of every outbound send.

pub mod engine;
pub mod stop;

pub use engine::ComplianceEngine;
pub use stop::is_stop_intent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an opt-out was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptOutSource {
    /// Explicit STOP reply from the lead.
    StopReply,
    /// Administrative action through the dashboard.
    Admin,
}

impl OptOutSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopReply => "stop_reply",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop_reply" => Some(Self::StopReply),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The authoritative opt-in/opt-out record for one phone+tenant pair.
///
/// Once `opted_out` is set it is never cleared automatically; only an
/// explicit, audited re-opt-in may clear it. Retained for a minimum of
/// five years.
#[derive(Debug, Clone)]
pub struct ConsentRecord {
    pub tenant_id: String,
    pub phone: String,
    pub opted_out: bool,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub opt_out_source: Option<OptOutSource>,
    pub re_opted_in_at: Option<DateTime<Utc>>,
    pub re_opt_in_actor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a send is unsolicited or a reply in an active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// Not triggered by an inbound message; counts against the cap.
    ColdOutreach,
    /// Triggered by an inbound message from the lead; cap-exempt.
    Reply,
}

/// Context for a proposed send.
#[derive(Debug, Clone, Copy)]
pub struct SendContext {
    pub kind: SendKind,
    /// First outbound message ever sent to this lead.
    pub first_contact: bool,
}

/// Why a send was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    OptedOut,
    QuietHours,
    ColdCapReached { cap: u32 },
    MissingIdentification,
    MissingOptOutNotice,
    MissingAiDisclosure,
    BannedLinkDomain { domain: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OptedOut => write!(f, "recipient has opted out"),
            Self::QuietHours => write!(f, "outside quiet-hours send window"),
            Self::ColdCapReached { cap } => {
                write!(f, "cold-outreach cap of {cap} reached")
            }
            Self::MissingIdentification => {
                write!(f, "first-contact message lacks business identification")
            }
            Self::MissingOptOutNotice => {
                write!(f, "first-contact message lacks opt-out instructions")
            }
            Self::MissingAiDisclosure => write!(f, "message lacks required AI disclosure"),
            Self::BannedLinkDomain { domain } => {
                write!(f, "message contains banned link domain {domain}")
            }
        }
    }
}

/// Outcome of a compliance evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn block_reason(&self) -> Option<&BlockReason> {
        match self {
            Self::Allowed => None,
            Self::Blocked(reason) => Some(reason),
        }
    }
}
