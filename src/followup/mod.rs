//! Follow-up scheduler — polls due nudges and reminders and re-enters the
//! conductor with them.
//!
//! The scheduler only decides *when* to fire. The conductor re-validates
//! state and compliance at execution time, so a follow-up that became
//! stale between scheduling and firing is skipped there, not here.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::conductor::{Conductor, LeadEvent};
use crate::error::Result;
use crate::store::{Database, FollowUpKind};

const BATCH_SIZE: usize = 20;

pub struct FollowUpScheduler {
    store: Arc<dyn Database>,
    conductor: Arc<Conductor>,
}

impl FollowUpScheduler {
    pub fn new(store: Arc<dyn Database>, conductor: Arc<Conductor>) -> Self {
        Self { store, conductor }
    }

    /// Fire everything currently due. Returns how many were dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        let due = self.store.due_followups(Utc::now(), BATCH_SIZE).await?;
        let count = due.len();

        for followup in due {
            let event = match followup.kind {
                FollowUpKind::Nudge => LeadEvent::FollowUpDue {
                    followup_id: followup.id,
                },
                FollowUpKind::Reminder => LeadEvent::ReminderDue {
                    followup_id: followup.id,
                },
            };
            if let Err(e) = self.conductor.handle_event(followup.lead_id, event).await {
                // Left pending; retried on the next tick.
                error!(
                    followup_id = %followup.id,
                    lead_id = %followup.lead_id,
                    error = %e,
                    "Follow-up dispatch failed"
                );
            }
        }
        Ok(count)
    }

    /// Spawn the polling loop.
    pub fn spawn(self: Arc<Self>, poll_interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            loop {
                tick.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "Follow-up pass complete"),
                    Err(e) => error!(error = %e, "Follow-up pass failed"),
                }
            }
        })
    }
}
