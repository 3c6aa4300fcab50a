//! Lead conductor — the single entry point for all lead state progression.
//!
//! Every inbound reply, timer fire, and administrative action becomes a
//! [`LeadEvent`] handled by [`Conductor::handle_event`]. The conductor
//! serializes handling per lead id, consults the persisted consent record
//! before every send, runs the two compliance passes around agent
//! composition, and only updates state and "already sent" flags after the
//! provider acknowledged the message.

pub mod event;
pub mod lead;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{AgentOutcome, AgentRoster, AgentStage};
use crate::compliance::engine::ComplianceEngine;
use crate::compliance::{is_stop_intent, BlockReason, OptOutSource, SendContext, SendKind, Verdict};
use crate::config::{SettingsStore, TenantSettings};
use crate::error::{ConductorError, Result};
use crate::events::{EventKind, EventLogEntry};
use crate::gateway::{EmailNotifier, MessagingGateway};
use crate::scheduling::{available_slots, Slot};
use crate::store::{
    Booking, Database, DeliveryStatus, FollowUpKind, FollowUpStatus, MessageDirection,
    MessageRecord,
};

pub use event::{AdminAction, LeadEvent};
pub use lead::{Lead, LeadSource, LeadState};

/// Hours until a nudge fires after we ask a question and hear nothing.
const NUDGE_DELAY_HOURS: i64 = 4;

/// Hours before the appointment window a reminder fires.
const REMINDER_LEAD_HOURS: i64 = 24;

/// Reschedule interval when a follow-up fires inside quiet hours.
const QUIET_RESCHEDULE_HOURS: i64 = 1;

/// How many days of slots a booking-stage agent may offer.
const SLOT_HORIZON_DAYS: i64 = 6;

/// Days a cold lead waits before the final unresponsiveness check.
const COLD_EXPIRY_DAYS: i64 = 7;

/// Injectable time source; production uses `Utc::now`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Conductor {
    store: Arc<dyn Database>,
    settings: Arc<dyn SettingsStore>,
    compliance: ComplianceEngine,
    agents: AgentRoster,
    gateway: Arc<MessagingGateway>,
    notifier: Option<Arc<EmailNotifier>>,
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    clock: Clock,
}

impl Conductor {
    pub fn new(
        store: Arc<dyn Database>,
        settings: Arc<dyn SettingsStore>,
        agents: AgentRoster,
        gateway: Arc<MessagingGateway>,
        notifier: Option<Arc<EmailNotifier>>,
    ) -> Self {
        Self {
            compliance: ComplianceEngine::new(Arc::clone(&store)),
            store,
            settings,
            agents,
            gateway,
            notifier,
            locks: RwLock::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Route an event for a phone+tenant pair, creating the lead on first
    /// contact from an unseen number. Returns the lead id.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        phone: &str,
        event: LeadEvent,
    ) -> Result<Uuid> {
        let lead = match self.store.find_lead(tenant_id, phone).await? {
            Some(lead) => lead,
            None => {
                let source = match &event {
                    LeadEvent::Intake { source, .. } => *source,
                    LeadEvent::InboundSms { .. } => LeadSource::SmsReply,
                    _ => LeadSource::Other,
                };
                let settings = self.settings.tenant_settings(tenant_id).await?;
                let mut lead = Lead::new(
                    tenant_id,
                    phone,
                    source,
                    settings.default_tz_offset_minutes,
                );
                self.store.insert_lead(&lead).await?;
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            tenant_id,
                            EventKind::LeadCreated,
                            format!("source {}", source.as_str()),
                        )
                        .for_lead(lead.id),
                    )
                    .await?;
                info!(lead_id = %lead.id, source = source.as_str(), "Lead created");

                // A standing opt-out for this number binds the fresh lead
                // record too; it must never sit around looking workable.
                if self
                    .store
                    .get_consent(tenant_id, phone)
                    .await?
                    .is_some_and(|c| c.opted_out)
                {
                    self.store
                        .update_lead_state(lead.id, LeadState::OptedOut)
                        .await?;
                    self.store
                        .append_event(
                            &EventLogEntry::new(
                                tenant_id,
                                EventKind::ComplianceDecision,
                                "created from opted-out number; no outreach",
                            )
                            .for_lead(lead.id),
                        )
                        .await?;
                    lead.state = LeadState::OptedOut;
                }
                lead
            }
        };

        let id = lead.id;
        self.handle_event(id, event).await?;
        Ok(id)
    }

    /// Single entry point for all state progression. Serialized per lead.
    pub async fn handle_event(&self, lead_id: Uuid, event: LeadEvent) -> Result<()> {
        let lock = self.lead_lock(lead_id).await;
        let _guard = lock.lock().await;

        // State and consent are re-read fresh under the lock; nothing from
        // before the lock was taken may be trusted.
        let mut lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or(ConductorError::LeadNotFound { id: lead_id })?;
        let settings = self.settings.tenant_settings(&lead.tenant_id).await?;

        let result = match event {
            LeadEvent::Intake {
                name,
                email,
                address,
                ..
            } => {
                self.on_intake(&mut lead, &settings, name, email, address)
                    .await
            }
            LeadEvent::InboundSms { body, received_at } => {
                self.on_inbound_sms(&mut lead, &settings, &body, received_at)
                    .await
            }
            LeadEvent::FollowUpDue { followup_id } => {
                self.on_followup_due(&mut lead, &settings, followup_id).await
            }
            LeadEvent::ReminderDue { followup_id } => {
                self.on_followup_due(&mut lead, &settings, followup_id).await
            }
            LeadEvent::BookingConfirmed {
                window_start,
                window_end,
            } => {
                self.on_booking_confirmed(&mut lead, &settings, window_start, window_end)
                    .await
            }
            LeadEvent::Admin(action) => self.on_admin(&mut lead, action).await,
        };

        // A terminal lead takes no further sends; its lock entry would
        // otherwise sit in the map forever. Left alone while another task
        // still holds a clone of the entry.
        if lead.state.is_terminal() {
            drop(_guard);
            let mut locks = self.locks.write().await;
            if let Some(entry) = locks.get(&lead_id)
                && Arc::strong_count(entry) <= 2
            {
                locks.remove(&lead_id);
            }
        }
        result
    }

    async fn lead_lock(&self, lead_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&lead_id) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(lead_id).or_default())
    }

    // ── Event handlers ──────────────────────────────────────────────

    async fn on_intake(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        name: Option<String>,
        email: Option<String>,
        address: Option<String>,
    ) -> Result<()> {
        if name.is_some() || email.is_some() || address.is_some() {
            self.store
                .update_lead_contact(
                    lead.id,
                    name.as_deref(),
                    email.as_deref(),
                    address.as_deref(),
                )
                .await?;
            lead.name = name.or(lead.name.take());
            lead.email = email.or(lead.email.take());
            lead.address = address.or(lead.address.take());
        }

        if lead.state != LeadState::New {
            info!(lead_id = %lead.id, state = lead.state.as_str(), "Repeat intake; no new outreach");
            return Ok(());
        }

        // The intake text is not a reply to anything the lead sent over
        // SMS, so it counts against the cold cap.
        let sent = self
            .compose_and_send(lead, settings, AgentStage::Intake, None, SendKind::ColdOutreach)
            .await?;

        match sent {
            Some(_) => {
                self.transition(lead, LeadState::IntakeSent).await?;
                self.reschedule_nudge(lead).await?;
            }
            None => {
                // Blocked (quiet hours, typically). The lead stays in `new`
                // and a follow-up retries the intake once the window can
                // reopen; the scheduler re-validates everything at fire time.
                let due_at = self.now() + Duration::hours(QUIET_RESCHEDULE_HOURS);
                self.store
                    .schedule_followup(lead.id, FollowUpKind::Nudge, due_at)
                    .await?;
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            &lead.tenant_id,
                            EventKind::FollowUpScheduled,
                            format!("intake retry at {}", due_at.to_rfc3339()),
                        )
                        .for_lead(lead.id),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_inbound_sms(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .insert_message(&MessageRecord {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                direction: MessageDirection::Inbound,
                content: body.to_string(),
                agent_id: None,
                delivery_status: None,
                provider_message_id: None,
                created_at: received_at,
            })
            .await?;
        if lead.first_response_at.is_none() {
            self.store.set_first_response(lead.id, received_at).await?;
            lead.first_response_at = Some(received_at);
        }

        if is_stop_intent(body) {
            return self.opt_out(lead, OptOutSource::StopReply).await;
        }

        // Authoritative record, never a cached flag. An inbound reply
        // after opt-out is logged but never re-activates the lead.
        if let Some(consent) = self.store.get_consent(&lead.tenant_id, &lead.phone).await?
            && consent.opted_out
        {
            self.store
                .append_event(
                    &EventLogEntry::new(
                        &lead.tenant_id,
                        EventKind::ComplianceDecision,
                        "inbound message from opted-out number; logged only",
                    )
                    .for_lead(lead.id),
                )
                .await?;
            return Ok(());
        }

        let stage = match lead.state {
            LeadState::New => AgentStage::Intake,
            LeadState::IntakeSent | LeadState::Qualifying | LeadState::Cold | LeadState::Dead => {
                AgentStage::Qualifying
            }
            LeadState::Qualified | LeadState::Booking => AgentStage::Booking,
            LeadState::Booked | LeadState::Completed => AgentStage::FollowUp,
            LeadState::OptedOut => return Ok(()),
        };

        let Some(outcome) = self
            .compose_and_send(lead, settings, stage, Some(body), SendKind::Reply)
            .await?
        else {
            return Ok(());
        };

        // Slot acceptance at the booking stage creates the booking.
        if stage == AgentStage::Booking
            && let Some(slot) = outcome.accepted_slot
        {
            self.create_booking(lead, settings, slot.start, slot.end)
                .await?;
            return Ok(());
        }

        let target = match stage {
            AgentStage::Intake => Some(LeadState::IntakeSent),
            AgentStage::Qualifying => {
                if outcome.ready_to_book {
                    Some(LeadState::Qualified)
                } else {
                    Some(LeadState::Qualifying)
                }
            }
            AgentStage::Booking => Some(LeadState::Booking),
            AgentStage::FollowUp => None,
        };
        if let Some(target) = target {
            self.transition(lead, target).await?;
        }
        self.reschedule_nudge(lead).await?;
        Ok(())
    }

    async fn on_followup_due(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        followup_id: Uuid,
    ) -> Result<()> {
        // Minutes-to-hours passed since this was scheduled: everything is
        // re-validated now, nothing from enqueue time is trusted.
        let Some(followup) = self.store.get_followup(followup_id).await? else {
            return Ok(());
        };
        if followup.status != FollowUpStatus::Pending {
            return Ok(());
        }

        let stale = match followup.kind {
            FollowUpKind::Nudge => matches!(
                lead.state,
                LeadState::Booked | LeadState::Completed | LeadState::OptedOut | LeadState::Dead
            ),
            FollowUpKind::Reminder => lead.state != LeadState::Booked,
        };
        let opted_out = self
            .store
            .get_consent(&lead.tenant_id, &lead.phone)
            .await?
            .is_some_and(|c| c.opted_out);

        if stale || opted_out {
            self.store.mark_followup_skipped(followup_id).await?;
            self.store
                .append_event(
                    &EventLogEntry::new(
                        &lead.tenant_id,
                        EventKind::FollowUpSkipped,
                        format!(
                            "{} skipped: {}",
                            followup.kind.as_str(),
                            if opted_out { "opted out" } else { "stale state" }
                        ),
                    )
                    .for_lead(lead.id),
                )
                .await?;
            return Ok(());
        }

        let ctx = SendContext {
            kind: SendKind::ColdOutreach,
            first_contact: self.store.count_outbound(lead.id).await? == 0,
        };
        let verdict = self
            .compliance
            .pre_check(lead, &ctx, &settings.compliance, self.now())
            .await?;
        if let Verdict::Blocked(reason) = verdict {
            self.log_block(lead, &reason.to_string()).await?;
            self.store.mark_followup_skipped(followup_id).await?;
            match reason {
                BlockReason::QuietHours => {
                    // Try again once the window opens instead of dropping it.
                    self.store
                        .schedule_followup(
                            lead.id,
                            followup.kind,
                            self.now() + Duration::hours(QUIET_RESCHEDULE_HOURS),
                        )
                        .await?;
                }
                BlockReason::ColdCapReached { .. }
                    if followup.kind == FollowUpKind::Nudge =>
                {
                    self.age_out(lead).await?;
                }
                _ => {}
            }
            return Ok(());
        }

        // A nudge for a lead still in `new` is a retried intake (the
        // original send was blocked); everything else is a follow-up touch.
        let stage = if lead.state == LeadState::New {
            AgentStage::Intake
        } else {
            AgentStage::FollowUp
        };

        let history = self.store.messages_for_lead(lead.id).await?;
        let persona = &settings.persona;
        let started = Instant::now();
        let outcome = match self
            .agents
            .compose(
                stage,
                lead,
                persona,
                &history,
                None,
                &[],
                ctx.first_contact,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.compliance.release_cold_reservation(lead, &ctx).await?;
                return Err(e.into());
            }
        };

        if let Verdict::Blocked(reason) =
            self.compliance
                .content_check(&outcome.content, &ctx, &settings.compliance, persona)
        {
            self.compliance.release_cold_reservation(lead, &ctx).await?;
            self.store.mark_followup_skipped(followup_id).await?;
            self.log_block(lead, &reason.to_string()).await?;
            return Ok(());
        }

        let receipt = match self.gateway.send(&lead.phone, &outcome.content).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // Still pending; the ticker retries it.
                self.compliance.release_cold_reservation(lead, &ctx).await?;
                return Err(e.into());
            }
        };

        // After the ack: message row, state, then the "already sent" flag,
        // in that order. A failure before the flag re-sends, never leaves
        // a sent marker with no record behind it.
        self.record_outbound(lead, &outcome, &receipt.provider_message_id, started)
            .await?;
        if lead.state == LeadState::New {
            self.transition(lead, LeadState::IntakeSent).await?;
        }
        self.store.mark_followup_sent(followup_id).await?;

        // Nudges recur until answered or the cold cap retires the lead.
        if followup.kind == FollowUpKind::Nudge {
            self.reschedule_nudge(lead).await?;
        }
        Ok(())
    }

    async fn on_booking_confirmed(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        self.create_booking(lead, settings, window_start, window_end)
            .await
    }

    async fn on_admin(&self, lead: &mut Lead, action: AdminAction) -> Result<()> {
        match action {
            AdminAction::SetState { state } => {
                if state == LeadState::OptedOut {
                    // Only the compliance pipeline may opt a lead out; it is
                    // the only path that updates consent, cancels follow-ups,
                    // and writes the audit entry.
                    self.store
                        .append_event(
                            &EventLogEntry::new(
                                &lead.tenant_id,
                                EventKind::ComplianceDecision,
                                "rejected admin write of opted_out state",
                            )
                            .for_lead(lead.id),
                        )
                        .await?;
                    return Err(ConductorError::PolicyViolation(
                        "opted_out may only be set by the compliance pipeline".into(),
                    )
                    .into());
                }
                self.transition(lead, state).await
            }
            AdminAction::OptOut => self.opt_out(lead, OptOutSource::Admin).await,
            AdminAction::ReOptIn { actor } => {
                let cleared = self
                    .store
                    .record_re_opt_in(&lead.tenant_id, &lead.phone, &actor)
                    .await?;
                if !cleared {
                    return Err(ConductorError::PolicyViolation(
                        "re-opt-in requires an existing opt-out".into(),
                    )
                    .into());
                }
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            &lead.tenant_id,
                            EventKind::ReOptIn,
                            format!("re-opted in by {actor}"),
                        )
                        .for_lead(lead.id),
                    )
                    .await?;
                if lead.state == LeadState::OptedOut {
                    // Audited exception to terminal opted_out.
                    self.store
                        .update_lead_state(lead.id, LeadState::Qualifying)
                        .await?;
                    self.store
                        .append_event(
                            &EventLogEntry::new(
                                &lead.tenant_id,
                                EventKind::StateTransition,
                                format!("{} -> {}", lead.state.as_str(), LeadState::Qualifying.as_str()),
                            )
                            .for_lead(lead.id),
                        )
                        .await?;
                    lead.state = LeadState::Qualifying;
                }
                Ok(())
            }
            AdminAction::MarkCompleted => self.transition(lead, LeadState::Completed).await,
        }
    }

    // ── Opt-out pipeline ────────────────────────────────────────────

    /// The only path that sets `opted_out`: consent record, follow-up
    /// cancellation, state, and a single audit entry, in that order.
    async fn opt_out(&self, lead: &mut Lead, source: OptOutSource) -> Result<()> {
        self.store
            .record_opt_out(&lead.tenant_id, &lead.phone, source)
            .await?;
        let cancelled = self.store.cancel_pending_followups(lead.id).await?;

        if lead.state != LeadState::OptedOut {
            self.store
                .update_lead_state(lead.id, LeadState::OptedOut)
                .await?;
            lead.state = LeadState::OptedOut;
        }

        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::OptOut,
                    format!(
                        "source {}; {cancelled} pending follow-ups cancelled",
                        source.as_str()
                    ),
                )
                .for_lead(lead.id),
            )
            .await?;
        info!(lead_id = %lead.id, "Lead opted out");
        Ok(())
    }

    // ── Send path ───────────────────────────────────────────────────

    /// Pre-check, compose, content-check, send, persist — in that order.
    ///
    /// Returns `None` when a compliance pass blocked the send (logged, not
    /// an error). The message row is written only after the provider ack.
    async fn compose_and_send(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        stage: AgentStage,
        inbound: Option<&str>,
        kind: SendKind,
    ) -> Result<Option<SendResult>> {
        let ctx = SendContext {
            kind,
            first_contact: self.store.count_outbound(lead.id).await? == 0,
        };

        let verdict = self
            .compliance
            .pre_check(lead, &ctx, &settings.compliance, self.now())
            .await?;
        if let Verdict::Blocked(reason) = verdict {
            self.log_block(lead, &reason.to_string()).await?;
            return Ok(None);
        }

        let slots = if stage == AgentStage::Booking {
            let local_today = self.now().with_timezone(&lead.local_offset()).date_naive();
            let horizon = local_today + Duration::days(SLOT_HORIZON_DAYS);
            available_slots(self.store.as_ref(), settings, &lead.tenant_id, local_today, horizon)
                .await?
        } else {
            Vec::new()
        };

        let history = self.store.messages_for_lead(lead.id).await?;
        let started = Instant::now();
        let outcome = match self
            .agents
            .compose(
                stage,
                lead,
                &settings.persona,
                &history,
                inbound,
                &slots,
                ctx.first_contact,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.compliance.release_cold_reservation(lead, &ctx).await?;
                return Err(e.into());
            }
        };

        // Second pass over the actual text, never a placeholder.
        if let Verdict::Blocked(reason) = self.compliance.content_check(
            &outcome.content,
            &ctx,
            &settings.compliance,
            &settings.persona,
        ) {
            self.compliance.release_cold_reservation(lead, &ctx).await?;
            self.log_block(lead, &reason.to_string()).await?;
            return Ok(None);
        }

        let receipt = match self.gateway.send(&lead.phone, &outcome.content).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.compliance.release_cold_reservation(lead, &ctx).await?;
                return Err(e.into());
            }
        };

        self.record_outbound(lead, &outcome, &receipt.provider_message_id, started)
            .await?;

        let accepted_slot = outcome.chosen_slot.and_then(|i| slots.get(i).copied());
        Ok(Some(SendResult {
            ready_to_book: outcome.ready_to_book,
            accepted_slot,
        }))
    }

    /// Persist the outbound message row and agent side-effects after a
    /// provider ack.
    async fn record_outbound(
        &self,
        lead: &mut Lead,
        outcome: &AgentOutcome,
        provider_message_id: &str,
        started: Instant,
    ) -> Result<()> {
        self.store
            .insert_message(&MessageRecord {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                direction: MessageDirection::Outbound,
                content: outcome.content.clone(),
                agent_id: Some(outcome.agent_id.clone()),
                delivery_status: Some(DeliveryStatus::Sent),
                provider_message_id: Some(provider_message_id.to_string()),
                created_at: self.now(),
            })
            .await?;

        let extracted = &outcome.extracted;
        if extracted.name.is_some() || extracted.email.is_some() || extracted.address.is_some() {
            self.store
                .update_lead_contact(
                    lead.id,
                    extracted.name.as_deref(),
                    extracted.email.as_deref(),
                    extracted.address.as_deref(),
                )
                .await?;
        }
        if let Some(score) = outcome.score {
            self.store.update_lead_score(lead.id, score).await?;
            lead.score = Some(score);
        }

        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::MessageSent,
                    format!("agent {}", outcome.agent_id),
                )
                .for_lead(lead.id)
                .with_duration_ms(started.elapsed().as_millis() as i64)
                .with_cost(outcome.cost),
            )
            .await?;
        Ok(())
    }

    async fn log_block(&self, lead: &Lead, reason: &str) -> Result<()> {
        warn!(lead_id = %lead.id, reason, "Send blocked");
        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::ComplianceDecision,
                    format!("blocked: {reason}"),
                )
                .for_lead(lead.id),
            )
            .await?;
        Ok(())
    }

    // ── Bookings and follow-ups ─────────────────────────────────────

    /// Create and record a booking. Idempotent: a confirmation for an
    /// already-booked lead is a no-op.
    async fn create_booking(
        &self,
        lead: &mut Lead,
        settings: &TenantSettings,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        if self.store.get_active_booking(lead.id).await?.is_some() {
            info!(lead_id = %lead.id, "Duplicate booking confirmation ignored");
            return Ok(());
        }

        // Reject an illegal confirmation before anything is written; a
        // failed transition must not leave an orphan booking behind.
        if lead.state != LeadState::Booked && !lead.state.can_transition(LeadState::Booked) {
            return Err(ConductorError::InvalidTransition {
                id: lead.id,
                from: lead.state.as_str().to_string(),
                to: LeadState::Booked.as_str().to_string(),
            }
            .into());
        }

        let booking = Booking::new(lead.id, &lead.tenant_id, window_start, window_end);
        let inserted = self
            .store
            .insert_booking(
                &booking,
                settings.daily_capacity,
                settings.default_tz_offset_minutes,
            )
            .await?;
        if !inserted {
            warn!(lead_id = %lead.id, "Booking refused: day at capacity");
            self.store
                .append_event(
                    &EventLogEntry::new(
                        &lead.tenant_id,
                        EventKind::ComplianceDecision,
                        "booking refused: daily capacity reached",
                    )
                    .for_lead(lead.id),
                )
                .await?;
            self.reschedule_nudge(lead).await?;
            return Ok(());
        }
        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::BookingCreated,
                    format!("window {} to {}", window_start.to_rfc3339(), window_end.to_rfc3339()),
                )
                .for_lead(lead.id),
            )
            .await?;

        self.transition(lead, LeadState::Booked).await?;

        // Replace any pending nudges with the appointment reminder.
        self.store.cancel_pending_followups(lead.id).await?;
        let reminder_at = (window_start - Duration::hours(REMINDER_LEAD_HOURS))
            .max(self.now() + Duration::hours(1));
        self.store
            .schedule_followup(lead.id, FollowUpKind::Reminder, reminder_at)
            .await?;
        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::FollowUpScheduled,
                    format!("reminder at {}", reminder_at.to_rfc3339()),
                )
                .for_lead(lead.id),
            )
            .await?;

        if let Some(notifier) = &self.notifier {
            let subject = format!("New booking: {}", lead.name.as_deref().unwrap_or(&lead.phone));
            let body = format!(
                "Lead: {} ({})\nWindow: {} to {}\nAddress: {}",
                lead.name.as_deref().unwrap_or("unknown"),
                lead.phone,
                window_start.to_rfc3339(),
                window_end.to_rfc3339(),
                lead.address.as_deref().unwrap_or("unknown"),
            );
            if let Err(e) = notifier.notify_owner(&subject, &body).await {
                warn!(error = %e, "Owner booking notification failed");
            }
        }
        Ok(())
    }

    /// Retire a lead whose nudge can no longer send: first to `cold` with
    /// one delayed re-check, then to `dead` if the check still cannot send.
    /// A reply at any point revives the lead back into qualification.
    async fn age_out(&self, lead: &mut Lead) -> Result<()> {
        match lead.state {
            LeadState::Cold => self.transition(lead, LeadState::Dead).await,
            _ if lead.state.can_transition(LeadState::Cold) => {
                self.transition(lead, LeadState::Cold).await?;
                let due_at = self.now() + Duration::days(COLD_EXPIRY_DAYS);
                self.store
                    .schedule_followup(lead.id, FollowUpKind::Nudge, due_at)
                    .await?;
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            &lead.tenant_id,
                            EventKind::FollowUpScheduled,
                            format!("cold expiry check at {}", due_at.to_rfc3339()),
                        )
                        .for_lead(lead.id),
                    )
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drop any pending follow-ups and schedule a fresh nudge.
    async fn reschedule_nudge(&self, lead: &Lead) -> Result<()> {
        // A booked lead's appointment reminder must survive later replies;
        // nudging ends once the appointment exists.
        if matches!(lead.state, LeadState::Booked | LeadState::Completed) {
            return Ok(());
        }
        self.store.cancel_pending_followups(lead.id).await?;
        let due_at = self.now() + Duration::hours(NUDGE_DELAY_HOURS);
        self.store
            .schedule_followup(lead.id, FollowUpKind::Nudge, due_at)
            .await?;
        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::FollowUpScheduled,
                    format!("nudge at {}", due_at.to_rfc3339()),
                )
                .for_lead(lead.id),
            )
            .await?;
        Ok(())
    }

    async fn transition(&self, lead: &mut Lead, to: LeadState) -> Result<()> {
        if lead.state == to {
            return Ok(());
        }
        if !lead.state.can_transition(to) {
            return Err(ConductorError::InvalidTransition {
                id: lead.id,
                from: lead.state.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into());
        }
        self.store.update_lead_state(lead.id, to).await?;
        self.store
            .append_event(
                &EventLogEntry::new(
                    &lead.tenant_id,
                    EventKind::StateTransition,
                    format!("{} -> {}", lead.state.as_str(), to.as_str()),
                )
                .for_lead(lead.id),
            )
            .await?;
        lead.state = to;
        Ok(())
    }
}

/// What a completed send tells the caller.
struct SendResult {
    ready_to_book: bool,
    accepted_slot: Option<Slot>,
}
