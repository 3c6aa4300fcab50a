//! Two-pass compliance enforcement.
//!
//! Pass one (`pre_check`) runs before anything is composed: consent, lead-local
//! quiet hours, and the cold-outreach cap. Pass two (`content_check`) runs on
//! the composed text itself: first-contact identification, the opt-out notice,
//! AI disclosure, and banned link domains.
//!
//! The consent lookup always goes to the store; consent is never cached across
//! sends, so an opt-out recorded moments ago wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::compliance::{BlockReason, SendContext, SendKind, Verdict};
use crate::config::{CompliancePolicy, Persona};
use crate::conductor::lead::Lead;
use crate::error::DatabaseError;
use crate::store::Database;

pub struct ComplianceEngine {
    store: Arc<dyn Database>,
}

impl ComplianceEngine {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Pre-composition gate. Checks, in order: opt-out status, quiet hours
    /// in the lead's local timezone, and the cold-outreach cap.
    ///
    /// On an allowed cold send this atomically reserves a cap slot; if the
    /// send is later blocked or fails, the caller must give the slot back
    /// with [`release_cold_reservation`](Self::release_cold_reservation).
    pub async fn pre_check(
        &self,
        lead: &Lead,
        ctx: &SendContext,
        policy: &CompliancePolicy,
        now: DateTime<Utc>,
    ) -> Result<Verdict, DatabaseError> {
        if let Some(consent) = self.store.get_consent(&lead.tenant_id, &lead.phone).await?
            && consent.opted_out
        {
            return Ok(Verdict::Blocked(BlockReason::OptedOut));
        }

        let local = now.with_timezone(&lead.local_offset()).time();
        if !policy.quiet_hours.allows(local) {
            debug!(lead_id = %lead.id, %local, "Send blocked by quiet hours");
            return Ok(Verdict::Blocked(BlockReason::QuietHours));
        }

        if ctx.kind == SendKind::ColdOutreach {
            let cap = policy.cold_outreach_cap;
            if !self.store.reserve_cold_slot(lead.id, cap).await? {
                return Ok(Verdict::Blocked(BlockReason::ColdCapReached { cap }));
            }
        }

        Ok(Verdict::Allowed)
    }

    /// Give back a cold-cap slot reserved by `pre_check` for a send that
    /// did not go out.
    pub async fn release_cold_reservation(
        &self,
        lead: &Lead,
        ctx: &SendContext,
    ) -> Result<(), DatabaseError> {
        if ctx.kind == SendKind::ColdOutreach {
            self.store.release_cold_slot(lead.id).await?;
        }
        Ok(())
    }

    /// Post-composition gate over the final message text.
    pub fn content_check(
        &self,
        content: &str,
        ctx: &SendContext,
        policy: &CompliancePolicy,
        persona: &Persona,
    ) -> Verdict {
        let lower = content.to_lowercase();

        if ctx.first_contact {
            if !lower.contains(&persona.business_name.to_lowercase()) {
                return Verdict::Blocked(BlockReason::MissingIdentification);
            }
            if !lower.contains("stop") {
                return Verdict::Blocked(BlockReason::MissingOptOutNotice);
            }
            if policy.ai_disclosure_required && !mentions_automation(&lower) {
                return Verdict::Blocked(BlockReason::MissingAiDisclosure);
            }
        }

        for domain in &policy.banned_link_domains {
            if lower.contains(&domain.to_lowercase()) {
                return Verdict::Blocked(BlockReason::BannedLinkDomain {
                    domain: domain.clone(),
                });
            }
        }

        Verdict::Allowed
    }
}

fn mentions_automation(lower: &str) -> bool {
    lower.contains("automated")
        || lower.contains("virtual assistant")
        || lower.contains(" ai ")
        || lower.contains("ai assistant")
        || lower.contains("ai-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::OptOutSource;
    use crate::conductor::lead::LeadSource;
    use crate::store::LibSqlBackend;
    use chrono::TimeZone;

    async fn engine() -> (ComplianceEngine, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (ComplianceEngine::new(Arc::clone(&store)), store)
    }

    fn persona() -> Persona {
        Persona {
            business_name: "Apex Plumbing".into(),
            tone: "friendly".into(),
            rep_name: None,
        }
    }

    fn cold_ctx() -> SendContext {
        SendContext {
            kind: SendKind::ColdOutreach,
            first_contact: true,
        }
    }

    fn reply_ctx() -> SendContext {
        SendContext {
            kind: SendKind::Reply,
            first_contact: false,
        }
    }

    /// A UTC instant whose lead-local time (UTC-5) is the given h/m/s.
    fn local_instant(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(h + 5) * 3600 + i64::from(m) * 60 + i64::from(s))
    }

    fn lead_est() -> Lead {
        Lead::new("t1", "+15551230000", LeadSource::WebForm, -300)
    }

    #[tokio::test]
    async fn quiet_hours_boundaries() {
        let (engine, store) = engine().await;
        let lead = lead_est();
        store.insert_lead(&lead).await.unwrap();
        let policy = CompliancePolicy::default();

        let at_open = engine
            .pre_check(&lead, &reply_ctx(), &policy, local_instant(8, 0, 0))
            .await
            .unwrap();
        assert!(at_open.is_allowed());

        let just_before = engine
            .pre_check(&lead, &reply_ctx(), &policy, local_instant(7, 59, 59))
            .await
            .unwrap();
        assert_eq!(just_before.block_reason(), Some(&BlockReason::QuietHours));

        let just_after = engine
            .pre_check(&lead, &reply_ctx(), &policy, local_instant(8, 0, 1))
            .await
            .unwrap();
        assert!(just_after.is_allowed());

        let at_close = engine
            .pre_check(&lead, &reply_ctx(), &policy, local_instant(21, 0, 0))
            .await
            .unwrap();
        assert_eq!(at_close.block_reason(), Some(&BlockReason::QuietHours));
    }

    #[tokio::test]
    async fn opted_out_lead_blocks_everything() {
        let (engine, store) = engine().await;
        let lead = lead_est();
        store.insert_lead(&lead).await.unwrap();
        store
            .record_opt_out("t1", "+15551230000", OptOutSource::StopReply)
            .await
            .unwrap();

        let verdict = engine
            .pre_check(&lead, &reply_ctx(), &CompliancePolicy::default(), local_instant(12, 0, 0))
            .await
            .unwrap();
        assert_eq!(verdict.block_reason(), Some(&BlockReason::OptedOut));
    }

    #[tokio::test]
    async fn cold_cap_reserves_and_blocks_at_limit() {
        let (engine, store) = engine().await;
        let lead = lead_est();
        store.insert_lead(&lead).await.unwrap();
        let policy = CompliancePolicy {
            cold_outreach_cap: 2,
            ..Default::default()
        };
        let now = local_instant(12, 0, 0);

        assert!(engine.pre_check(&lead, &cold_ctx(), &policy, now).await.unwrap().is_allowed());
        assert!(engine.pre_check(&lead, &cold_ctx(), &policy, now).await.unwrap().is_allowed());
        let third = engine.pre_check(&lead, &cold_ctx(), &policy, now).await.unwrap();
        assert_eq!(
            third.block_reason(),
            Some(&BlockReason::ColdCapReached { cap: 2 })
        );

        // A failed send gives the slot back.
        engine.release_cold_reservation(&lead, &cold_ctx()).await.unwrap();
        assert!(engine.pre_check(&lead, &cold_ctx(), &policy, now).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn replies_never_consume_cold_slots() {
        let (engine, store) = engine().await;
        let lead = lead_est();
        store.insert_lead(&lead).await.unwrap();
        let policy = CompliancePolicy {
            cold_outreach_cap: 1,
            ..Default::default()
        };
        let now = local_instant(12, 0, 0);

        for _ in 0..5 {
            assert!(engine.pre_check(&lead, &reply_ctx(), &policy, now).await.unwrap().is_allowed());
        }
        assert_eq!(store.cold_count(lead.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_contact_content_requirements() {
        let (engine, _) = engine().await;
        let policy = CompliancePolicy::default();
        let persona = persona();

        let missing_name = engine.content_check(
            "Hi! Thanks for reaching out. Reply STOP to opt out.",
            &cold_ctx(),
            &policy,
            &persona,
        );
        assert_eq!(
            missing_name.block_reason(),
            Some(&BlockReason::MissingIdentification)
        );

        let missing_notice = engine.content_check(
            "Hi, this is Apex Plumbing! When works for you?",
            &cold_ctx(),
            &policy,
            &persona,
        );
        assert_eq!(
            missing_notice.block_reason(),
            Some(&BlockReason::MissingOptOutNotice)
        );

        let ok = engine.content_check(
            "Hi, this is Apex Plumbing! When works for you? Reply STOP to opt out.",
            &cold_ctx(),
            &policy,
            &persona,
        );
        assert!(ok.is_allowed());

        // Later replies carry no footer requirements.
        let bare_reply = engine.content_check("Sounds good, see you then!", &reply_ctx(), &policy, &persona);
        assert!(bare_reply.is_allowed());
    }

    #[tokio::test]
    async fn ai_disclosure_enforced_when_required() {
        let (engine, _) = engine().await;
        let policy = CompliancePolicy {
            ai_disclosure_required: true,
            ..Default::default()
        };
        let persona = persona();

        let undisclosed = engine.content_check(
            "Hi, this is Apex Plumbing! Reply STOP to opt out.",
            &cold_ctx(),
            &policy,
            &persona,
        );
        assert_eq!(
            undisclosed.block_reason(),
            Some(&BlockReason::MissingAiDisclosure)
        );

        let disclosed = engine.content_check(
            "Hi, this is the automated assistant for Apex Plumbing! Reply STOP to opt out.",
            &cold_ctx(),
            &policy,
            &persona,
        );
        assert!(disclosed.is_allowed());
    }

    #[tokio::test]
    async fn banned_link_domains_blocked_on_any_send() {
        let (engine, _) = engine().await;
        let policy = CompliancePolicy::default();
        let persona = persona();

        let shortened = engine.content_check(
            "Here's our booking page: https://bit.ly/3xYz",
            &reply_ctx(),
            &policy,
            &persona,
        );
        assert_eq!(
            shortened.block_reason(),
            Some(&BlockReason::BannedLinkDomain {
                domain: "bit.ly".into()
            })
        );

        let plain = engine.content_check(
            "Here's our booking page: https://apexplumbing.com/book",
            &reply_ctx(),
            &policy,
            &persona,
        );
        assert!(plain.is_allowed());
    }
}
