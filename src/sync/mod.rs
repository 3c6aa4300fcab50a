//! CRM synchronization — the integration trait and the retry worker.
//!
//! Confirmed bookings are pushed to the client's CRM in the background.
//! Failures back off exponentially with jitter; `crm_next_retry_at`
//! strictly increases on every failure, and after the retry ceiling the
//! record is flagged for manual reconciliation instead of retrying
//! forever.

pub mod crm;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::conductor::lead::Lead;
use crate::error::{Result, SyncError};
use crate::events::{EventKind, EventLogEntry};
use crate::scheduling::Slot;
use crate::store::{Booking, Database};

pub use crm::{HttpCrm, HttpCrmConfig};

/// Uniform interface every CRM/scheduling integration implements.
///
/// Adapters map the full internal lead and booking shape into the target
/// system's payload; dropping fields the target supports is a data-loss
/// bug.
#[async_trait::async_trait]
pub trait CrmIntegration: Send + Sync {
    fn name(&self) -> &str;

    /// Create (or find) the customer, returning the CRM customer id.
    async fn create_customer(&self, lead: &Lead) -> std::result::Result<String, SyncError>;

    /// Create the booking under an existing customer, returning the CRM
    /// booking id.
    async fn create_booking(
        &self,
        lead: &Lead,
        booking: &Booking,
        crm_customer_id: &str,
    ) -> std::result::Result<String, SyncError>;

    /// Windows the external system reports as open.
    async fn get_available_slots(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> std::result::Result<Vec<Slot>, SyncError>;
}

pub struct SyncWorker {
    store: Arc<dyn Database>,
    crm: Arc<dyn CrmIntegration>,
    /// Failures before a booking is abandoned to manual reconciliation.
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    batch_size: usize,
}

impl SyncWorker {
    pub fn new(store: Arc<dyn Database>, crm: Arc<dyn CrmIntegration>) -> Self {
        Self {
            store,
            crm,
            max_retries: 5,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::hours(1),
            batch_size: 10,
        }
    }

    #[cfg(test)]
    fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Poll once for due bookings and sync them. Returns how many were
    /// attempted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_crm_syncs(now, self.batch_size).await?;
        let count = due.len();

        for booking in due {
            if let Err(e) = self.sync_one(&booking, now).await {
                // Failure is recorded on the row; the next poll retries.
                warn!(booking_id = %booking.id, error = %e, "CRM sync attempt failed");
            }
        }
        Ok(count)
    }

    async fn sync_one(&self, booking: &Booking, now: DateTime<Utc>) -> Result<()> {
        let lead = self
            .store
            .get_lead(booking.lead_id)
            .await?
            .ok_or(crate::error::DatabaseError::NotFound {
                entity: "lead".into(),
                id: booking.lead_id.to_string(),
            })?;

        let started = Instant::now();
        match self.push(&lead, booking).await {
            Ok((customer_id, crm_booking_id)) => {
                self.store
                    .mark_crm_synced(booking.id, &customer_id, &crm_booking_id)
                    .await?;
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            &booking.tenant_id,
                            EventKind::CrmSyncOutcome,
                            format!("synced as {crm_booking_id}"),
                        )
                        .for_lead(lead.id)
                        .with_duration_ms(started.elapsed().as_millis() as i64),
                    )
                    .await?;
                info!(booking_id = %booking.id, "Booking synced to CRM");
                Ok(())
            }
            Err(e) => {
                let retry_count = booking.crm_retry_count + 1;
                let abandoned = retry_count >= self.max_retries;
                let next_retry_at = if abandoned {
                    None
                } else {
                    Some(now + self.backoff(retry_count))
                };
                self.store
                    .record_crm_failure(booking.id, retry_count, next_retry_at, abandoned)
                    .await?;
                self.store
                    .append_event(
                        &EventLogEntry::new(
                            &booking.tenant_id,
                            EventKind::CrmSyncOutcome,
                            if abandoned {
                                format!("abandoned after {retry_count} attempts: {e}")
                            } else {
                                format!("attempt {retry_count} failed: {e}")
                            },
                        )
                        .for_lead(lead.id)
                        .with_duration_ms(started.elapsed().as_millis() as i64),
                    )
                    .await?;
                if abandoned {
                    // Operator queue: surfaced on the dashboard via the
                    // audit feed and the abandoned status.
                    error!(
                        booking_id = %booking.id,
                        attempts = retry_count,
                        "Booking abandoned to manual CRM reconciliation"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Push one booking: customer first, then the booking under it. The
    /// customer id is persisted as soon as it exists so a later retry
    /// never creates a duplicate customer.
    async fn push(
        &self,
        lead: &Lead,
        booking: &Booking,
    ) -> std::result::Result<(String, String), SyncError> {
        let customer_id = match &booking.crm_customer_id {
            Some(id) => id.clone(),
            None => {
                let id = self.crm.create_customer(lead).await?;
                if let Err(e) = self.store.set_crm_customer_id(booking.id, &id).await {
                    warn!(booking_id = %booking.id, error = %e, "Failed to persist CRM customer id");
                }
                id
            }
        };

        let crm_booking_id = self.crm.create_booking(lead, booking, &customer_id).await?;
        Ok((customer_id, crm_booking_id))
    }

    /// Exponential backoff with jitter, capped.
    fn backoff(&self, retry_count: u32) -> Duration {
        let exp = self.base_backoff * 2_i32.saturating_pow(retry_count.min(16));
        let capped = exp.min(self.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.num_milliseconds() / 4);
        capped + Duration::milliseconds(jitter_ms)
    }

    /// Spawn the polling loop.
    pub fn spawn(self: Arc<Self>, poll_interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            loop {
                tick.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "CRM sync pass complete"),
                    Err(e) => error!(error = %e, "CRM sync pass failed"),
                }
            }
        })
    }
}
