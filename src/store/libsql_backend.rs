//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All datetimes are stored
//! as RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::compliance::{ConsentRecord, OptOutSource};
use crate::conductor::lead::{Lead, LeadSource, LeadState};
use crate::error::DatabaseError;
use crate::events::{EventKind, EventLogEntry};
use crate::store::migrations;
use crate::store::traits::{
    Booking, BookingStatus, CrmSyncStatus, Database, DeliveryStatus, FollowUp, FollowUpKind,
    FollowUpStatus, MessageDirection, MessageRecord,
};

const LEAD_COLUMNS: &str = "id, tenant_id, phone, name, email, address, source, state, score, \
     tz_offset_minutes, first_response_at, state_entered_at, created_at, updated_at";

const BOOKING_COLUMNS: &str = "id, lead_id, tenant_id, window_start, window_end, status, technician, \
     crm_sync_status, crm_retry_count, crm_next_retry_at, crm_customer_id, \
     crm_booking_id, created_at, updated_at";

const FOLLOWUP_COLUMNS: &str = "id, lead_id, kind, due_at, status, sent_at, created_at";

const MESSAGE_COLUMNS: &str =
    "id, lead_id, direction, content, agent_id, delivery_status, provider_message_id, created_at";

/// libSQL database backend.
///
/// Stores a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| {
        DatabaseError::Serialization(format!("bad {entity} id {s}: {e}"))
    })
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let state_str: String = row.get(7).map_err(query_err)?;
    let state = LeadState::parse(&state_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown lead state '{state_str}'"))
    })?;
    let source_str: String = row.get(6).map_err(query_err)?;

    Ok(Lead {
        id: parse_uuid(&id_str, "lead")?,
        tenant_id: row.get(1).map_err(query_err)?,
        phone: row.get(2).map_err(query_err)?,
        name: row.get(3).ok(),
        email: row.get(4).ok(),
        address: row.get(5).ok(),
        source: LeadSource::parse(&source_str),
        state,
        score: row.get(8).ok(),
        tz_offset_minutes: row.get::<i64>(9).map_err(query_err)? as i32,
        first_response_at: parse_optional_datetime(row.get(10).ok()),
        state_entered_at: parse_datetime(&row.get::<String>(11).map_err(query_err)?),
        created_at: parse_datetime(&row.get::<String>(12).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(13).map_err(query_err)?),
    })
}

fn row_to_booking(row: &libsql::Row) -> Result<Booking, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let lead_str: String = row.get(1).map_err(query_err)?;
    let status_str: String = row.get(5).map_err(query_err)?;
    let sync_str: String = row.get(7).map_err(query_err)?;

    Ok(Booking {
        id: parse_uuid(&id_str, "booking")?,
        lead_id: parse_uuid(&lead_str, "lead")?,
        tenant_id: row.get(2).map_err(query_err)?,
        window_start: parse_datetime(&row.get::<String>(3).map_err(query_err)?),
        window_end: parse_datetime(&row.get::<String>(4).map_err(query_err)?),
        status: if status_str == "cancelled" {
            BookingStatus::Cancelled
        } else {
            BookingStatus::Confirmed
        },
        technician: row.get(6).ok(),
        crm_sync_status: CrmSyncStatus::parse(&sync_str).unwrap_or(CrmSyncStatus::Pending),
        crm_retry_count: row.get::<i64>(8).map_err(query_err)? as u32,
        crm_next_retry_at: parse_optional_datetime(row.get(9).ok()),
        crm_customer_id: row.get(10).ok(),
        crm_booking_id: row.get(11).ok(),
        created_at: parse_datetime(&row.get::<String>(12).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(13).map_err(query_err)?),
    })
}

fn row_to_followup(row: &libsql::Row) -> Result<FollowUp, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let lead_str: String = row.get(1).map_err(query_err)?;
    let kind_str: String = row.get(2).map_err(query_err)?;
    let status_str: String = row.get(4).map_err(query_err)?;

    Ok(FollowUp {
        id: parse_uuid(&id_str, "followup")?,
        lead_id: parse_uuid(&lead_str, "lead")?,
        kind: FollowUpKind::parse(&kind_str).unwrap_or(FollowUpKind::Nudge),
        due_at: parse_datetime(&row.get::<String>(3).map_err(query_err)?),
        status: FollowUpStatus::parse(&status_str).unwrap_or(FollowUpStatus::Pending),
        sent_at: parse_optional_datetime(row.get(5).ok()),
        created_at: parse_datetime(&row.get::<String>(6).map_err(query_err)?),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let lead_str: String = row.get(1).map_err(query_err)?;
    let direction_str: String = row.get(2).map_err(query_err)?;

    Ok(MessageRecord {
        id: parse_uuid(&id_str, "message")?,
        lead_id: parse_uuid(&lead_str, "lead")?,
        direction: if direction_str == "inbound" {
            MessageDirection::Inbound
        } else {
            MessageDirection::Outbound
        },
        content: row.get(3).map_err(query_err)?,
        agent_id: row.get(4).ok(),
        delivery_status: row
            .get::<String>(5)
            .ok()
            .and_then(|s| DeliveryStatus::parse(&s)),
        provider_message_id: row.get(6).ok(),
        created_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
    })
}

fn row_to_consent(row: &libsql::Row) -> Result<ConsentRecord, DatabaseError> {
    Ok(ConsentRecord {
        tenant_id: row.get(0).map_err(query_err)?,
        phone: row.get(1).map_err(query_err)?,
        opted_out: row.get::<i64>(2).map_err(query_err)? != 0,
        opted_out_at: parse_optional_datetime(row.get(3).ok()),
        opt_out_source: row
            .get::<String>(4)
            .ok()
            .and_then(|s| OptOutSource::parse(&s)),
        re_opted_in_at: parse_optional_datetime(row.get(5).ok()),
        re_opt_in_actor: row.get(6).ok(),
        updated_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<EventLogEntry, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let kind_str: String = row.get(3).map_err(query_err)?;

    Ok(EventLogEntry {
        id: parse_uuid(&id_str, "event")?,
        tenant_id: row.get(1).map_err(query_err)?,
        lead_id: row
            .get::<String>(2)
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok()),
        kind: EventKind::parse(&kind_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown event kind '{kind_str}'"))
        })?,
        detail: row.get(4).map_err(query_err)?,
        duration_ms: row.get(5).ok(),
        cost: row
            .get::<String>(6)
            .ok()
            .and_then(|s| s.parse().ok()),
        created_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO leads (id, tenant_id, phone, name, email, address, source, state,
                    score, tz_offset_minutes, first_response_at, state_entered_at,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    lead.id.to_string(),
                    lead.tenant_id.clone(),
                    lead.phone.clone(),
                    lead.name.clone(),
                    lead.email.clone(),
                    lead.address.clone(),
                    lead.source.as_str(),
                    lead.state.as_str(),
                    lead.score,
                    i64::from(lead.tz_offset_minutes),
                    lead.first_response_at.map(|t| t.to_rfc3339()),
                    lead.state_entered_at.to_rfc3339(),
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "lead already exists for tenant {} phone {}",
                        lead.tenant_id, lead.phone
                    ))
                } else {
                    query_err(e)
                }
            })?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_lead(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND phone = ?2"),
                params![tenant_id, phone],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_lead_state(&self, id: Uuid, state: LeadState) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET state = ?1, state_entered_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_first_response(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET first_response_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND first_response_at IS NULL",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_lead_score(&self, id: Uuid, score: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET score = ?1, updated_at = ?2 WHERE id = ?3",
                params![score, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_lead_contact(
        &self,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
        address: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET
                    name = COALESCE(?1, name),
                    email = COALESCE(?2, email),
                    address = COALESCE(?3, address),
                    updated_at = ?4
                 WHERE id = ?5",
                params![name, email, address, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Consent ─────────────────────────────────────────────────────

    async fn get_consent(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<ConsentRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tenant_id, phone, opted_out, opted_out_at, opt_out_source,
                        re_opted_in_at, re_opt_in_actor, updated_at
                 FROM consent_records WHERE tenant_id = ?1 AND phone = ?2",
                params![tenant_id, phone],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_consent(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_opt_out(
        &self,
        tenant_id: &str,
        phone: &str,
        source: OptOutSource,
    ) -> Result<(), DatabaseError> {
        // Idempotent: an existing opt-out keeps its original timestamp
        // and source.
        if let Some(existing) = self.get_consent(tenant_id, phone).await?
            && existing.opted_out
        {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO consent_records
                    (tenant_id, phone, opted_out, opted_out_at, opt_out_source,
                     re_opted_in_at, re_opt_in_actor, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4, NULL, NULL, ?3)
                 ON CONFLICT(tenant_id, phone) DO UPDATE SET
                    opted_out = 1,
                    opted_out_at = excluded.opted_out_at,
                    opt_out_source = excluded.opt_out_source,
                    re_opted_in_at = NULL,
                    re_opt_in_actor = NULL,
                    updated_at = excluded.updated_at",
                params![tenant_id, phone, now, source.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_re_opt_in(
        &self,
        tenant_id: &str,
        phone: &str,
        actor: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE consent_records SET
                    opted_out = 0, re_opted_in_at = ?1, re_opt_in_actor = ?2, updated_at = ?1
                 WHERE tenant_id = ?3 AND phone = ?4 AND opted_out = 1",
                params![now, actor, tenant_id, phone],
            )
            .await
            .map_err(query_err)?;
        Ok(changed > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    record.id.to_string(),
                    record.lead_id.to_string(),
                    record.direction.as_str(),
                    record.content.clone(),
                    record.agent_id.clone(),
                    record.delivery_status.map(|s| s.as_str()),
                    record.provider_message_id.clone(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn apply_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, DatabaseError> {
        // Terminal statuses (delivered, failed) are never overwritten;
        // duplicate callbacks are no-ops.
        let changed = self
            .conn()
            .execute(
                "UPDATE messages SET delivery_status = ?1
                 WHERE provider_message_id = ?2
                   AND direction = 'outbound'
                   AND COALESCE(delivery_status, '') <> ?1
                   AND COALESCE(delivery_status, '') NOT IN ('delivered', 'failed')",
                params![status.as_str(), provider_message_id],
            )
            .await
            .map_err(query_err)?;
        Ok(changed > 0)
    }

    async fn count_outbound(&self, lead_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE lead_id = ?1 AND direction = 'outbound'",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u64),
            None => Ok(0),
        }
    }

    async fn messages_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE lead_id = ?1 ORDER BY created_at"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_message(&row)?);
        }
        Ok(out)
    }

    // ── Bookings ────────────────────────────────────────────────────

    async fn insert_booking(
        &self,
        booking: &Booking,
        daily_capacity: u32,
        tz_offset_minutes: i32,
    ) -> Result<bool, DatabaseError> {
        // Capacity is checked inside the insert itself, the same
        // compare-and-increment discipline as the cold counter: racing
        // confirmations cannot overbook the day.
        let offset = FixedOffset::east_opt(tz_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        let local_day = booking.window_start.with_timezone(&offset).date_naive();
        let day_start = offset
            .from_local_datetime(&local_day.and_hms_opt(0, 0, 0).expect("valid time"))
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(booking.window_start);
        let day_end = day_start + chrono::Duration::days(1);

        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO bookings ({BOOKING_COLUMNS})
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
                     WHERE (SELECT COUNT(*) FROM bookings
                            WHERE tenant_id = ?3 AND status = 'confirmed'
                              AND window_start >= ?15 AND window_start < ?16) < ?17"
                ),
                params![
                    booking.id.to_string(),
                    booking.lead_id.to_string(),
                    booking.tenant_id.clone(),
                    booking.window_start.to_rfc3339(),
                    booking.window_end.to_rfc3339(),
                    booking.status.as_str(),
                    booking.technician.clone(),
                    booking.crm_sync_status.as_str(),
                    i64::from(booking.crm_retry_count),
                    booking.crm_next_retry_at.map(|t| t.to_rfc3339()),
                    booking.crm_customer_id.clone(),
                    booking.crm_booking_id.clone(),
                    booking.created_at.to_rfc3339(),
                    booking.updated_at.to_rfc3339(),
                    day_start.to_rfc3339(),
                    day_end.to_rfc3339(),
                    i64::from(daily_capacity),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "active booking already exists for lead {}",
                        booking.lead_id
                    ))
                } else {
                    query_err(e)
                }
            })?;
        Ok(changed > 0)
    }

    async fn get_active_booking(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<Booking>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE lead_id = ?1 AND status = 'confirmed'"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_booking(&row)?)),
            None => Ok(None),
        }
    }

    async fn confirmed_bookings_in_range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE tenant_id = ?1 AND status = 'confirmed'
                       AND window_start < ?2 AND window_end > ?3
                     ORDER BY window_start"
                ),
                params![tenant_id, end.to_rfc3339(), start.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_booking(&row)?);
        }
        Ok(out)
    }

    async fn due_crm_syncs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE status = 'confirmed'
                       AND crm_sync_status IN ('pending', 'failed')
                       AND crm_next_retry_at IS NOT NULL
                       AND crm_next_retry_at <= ?1
                     ORDER BY crm_next_retry_at
                     LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_booking(&row)?);
        }
        Ok(out)
    }

    async fn mark_crm_synced(
        &self,
        id: Uuid,
        crm_customer_id: &str,
        crm_booking_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bookings SET
                    crm_sync_status = 'synced',
                    crm_customer_id = ?1,
                    crm_booking_id = ?2,
                    crm_next_retry_at = NULL,
                    updated_at = ?3
                 WHERE id = ?4",
                params![
                    crm_customer_id,
                    crm_booking_id,
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_crm_failure(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        abandoned: bool,
    ) -> Result<(), DatabaseError> {
        let status = if abandoned { "abandoned" } else { "failed" };
        self.conn()
            .execute(
                "UPDATE bookings SET
                    crm_sync_status = ?1,
                    crm_retry_count = ?2,
                    crm_next_retry_at = ?3,
                    updated_at = ?4
                 WHERE id = ?5",
                params![
                    status,
                    i64::from(retry_count),
                    next_retry_at.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_crm_customer_id(
        &self,
        id: Uuid,
        crm_customer_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bookings SET crm_customer_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![crm_customer_id, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Follow-ups ──────────────────────────────────────────────────

    async fn schedule_followup(
        &self,
        lead_id: Uuid,
        kind: FollowUpKind,
        due_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO followups (id, lead_id, kind, due_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![
                    id.to_string(),
                    lead_id.to_string(),
                    kind.as_str(),
                    due_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    async fn due_followups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FollowUp>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FOLLOWUP_COLUMNS} FROM followups
                     WHERE status = 'pending' AND due_at <= ?1
                     ORDER BY due_at LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_followup(&row)?);
        }
        Ok(out)
    }

    async fn get_followup(&self, id: Uuid) -> Result<Option<FollowUp>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FOLLOWUP_COLUMNS} FROM followups WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_followup(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_followup_sent(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE followups SET status = 'sent', sent_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_followup_skipped(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE followups SET status = 'skipped'
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn cancel_pending_followups(&self, lead_id: Uuid) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE followups SET status = 'cancelled'
                 WHERE lead_id = ?1 AND status = 'pending'",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(changed as usize)
    }

    // ── Cold-outreach counter ───────────────────────────────────────

    async fn reserve_cold_slot(&self, lead_id: Uuid, cap: u32) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO cold_counters (lead_id, used, updated_at) VALUES (?1, 0, ?2)
                 ON CONFLICT(lead_id) DO NOTHING",
                params![lead_id.to_string(), now.clone()],
            )
            .await
            .map_err(query_err)?;

        let changed = self
            .conn()
            .execute(
                "UPDATE cold_counters SET used = used + 1, updated_at = ?1
                 WHERE lead_id = ?2 AND used < ?3",
                params![now, lead_id.to_string(), i64::from(cap)],
            )
            .await
            .map_err(query_err)?;
        Ok(changed > 0)
    }

    async fn release_cold_slot(&self, lead_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE cold_counters SET used = used - 1, updated_at = ?1
                 WHERE lead_id = ?2 AND used > 0",
                params![Utc::now().to_rfc3339(), lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn cold_count(&self, lead_id: Uuid) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT used FROM cold_counters WHERE lead_id = ?1",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u32),
            None => Ok(0),
        }
    }

    // ── Event log ───────────────────────────────────────────────────

    async fn append_event(&self, entry: &EventLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO event_log
                    (id, tenant_id, lead_id, kind, detail, duration_ms, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.to_string(),
                    entry.tenant_id.clone(),
                    entry.lead_id.map(|id| id.to_string()),
                    entry.kind.as_str(),
                    entry.detail.clone(),
                    entry.duration_ms,
                    entry.cost.map(|c| c.to_string()),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn events_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, lead_id, kind, detail, duration_ms, cost, created_at
                 FROM event_log WHERE lead_id = ?1 ORDER BY created_at",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_event(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::lead::LeadSource;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seed_lead(db: &LibSqlBackend) -> Lead {
        let lead = Lead::new("t1", "+15551230000", LeadSource::WebForm, -300);
        db.insert_lead(&lead).await.unwrap();
        lead
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.db");

        let lead = Lead::new("t1", "+15551230000", LeadSource::WebForm, -300);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_lead(&lead).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.phone, "+15551230000");
    }

    #[tokio::test]
    async fn lead_round_trip() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;

        let loaded = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.phone, "+15551230000");
        assert_eq!(loaded.state, LeadState::New);
        assert_eq!(loaded.tz_offset_minutes, -300);

        let found = db.find_lead("t1", "+15551230000").await.unwrap();
        assert!(found.is_some());
        assert!(db.find_lead("t1", "+15559999999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_lead_rejected() {
        let db = test_db().await;
        seed_lead(&db).await;
        let dup = Lead::new("t1", "+15551230000", LeadSource::LeadAds, 0);
        let err = db.insert_lead(&dup).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn first_response_set_only_once() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;

        let first = Utc::now();
        db.set_first_response(lead.id, first).await.unwrap();
        db.set_first_response(lead.id, first + chrono::Duration::hours(1))
            .await
            .unwrap();

        let loaded = db.get_lead(lead.id).await.unwrap().unwrap();
        let recorded = loaded.first_response_at.unwrap();
        assert!((recorded - first).num_seconds().abs() < 2);
    }

    #[tokio::test]
    async fn opt_out_is_idempotent_and_keeps_source() {
        let db = test_db().await;
        db.record_opt_out("t1", "+15551230000", OptOutSource::StopReply)
            .await
            .unwrap();
        db.record_opt_out("t1", "+15551230000", OptOutSource::Admin)
            .await
            .unwrap();

        let consent = db.get_consent("t1", "+15551230000").await.unwrap().unwrap();
        assert!(consent.opted_out);
        assert_eq!(consent.opt_out_source, Some(OptOutSource::StopReply));
    }

    #[tokio::test]
    async fn re_opt_in_requires_prior_opt_out() {
        let db = test_db().await;
        assert!(
            !db.record_re_opt_in("t1", "+15551230000", "admin@x.com")
                .await
                .unwrap()
        );

        db.record_opt_out("t1", "+15551230000", OptOutSource::StopReply)
            .await
            .unwrap();
        assert!(
            db.record_re_opt_in("t1", "+15551230000", "admin@x.com")
                .await
                .unwrap()
        );

        let consent = db.get_consent("t1", "+15551230000").await.unwrap().unwrap();
        assert!(!consent.opted_out);
        assert_eq!(consent.re_opt_in_actor.as_deref(), Some("admin@x.com"));
    }

    #[tokio::test]
    async fn delivery_status_applies_idempotently() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;

        let msg = MessageRecord {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            direction: MessageDirection::Outbound,
            content: "hi".into(),
            agent_id: Some("intake".into()),
            delivery_status: Some(DeliveryStatus::Sent),
            provider_message_id: Some("SM123".into()),
            created_at: Utc::now(),
        };
        db.insert_message(&msg).await.unwrap();

        assert!(
            db.apply_delivery_status("SM123", DeliveryStatus::Delivered)
                .await
                .unwrap()
        );
        // Duplicate callback is a no-op.
        assert!(
            !db.apply_delivery_status("SM123", DeliveryStatus::Delivered)
                .await
                .unwrap()
        );
        // Late "sent" never regresses a terminal status.
        assert!(
            !db.apply_delivery_status("SM123", DeliveryStatus::Sent)
                .await
                .unwrap()
        );
        // Unknown id is a no-op.
        assert!(
            !db.apply_delivery_status("SM999", DeliveryStatus::Delivered)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn cold_slot_reservation_respects_cap() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;

        assert!(db.reserve_cold_slot(lead.id, 3).await.unwrap());
        assert!(db.reserve_cold_slot(lead.id, 3).await.unwrap());
        assert!(db.reserve_cold_slot(lead.id, 3).await.unwrap());
        assert!(!db.reserve_cold_slot(lead.id, 3).await.unwrap());
        assert_eq!(db.cold_count(lead.id).await.unwrap(), 3);

        db.release_cold_slot(lead.id).await.unwrap();
        assert!(db.reserve_cold_slot(lead.id, 3).await.unwrap());
        assert!(!db.reserve_cold_slot(lead.id, 3).await.unwrap());
    }

    #[tokio::test]
    async fn due_crm_syncs_excludes_future_rows() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;
        let now = Utc::now();

        let mut due = Booking::new(lead.id, "t1", now, now + chrono::Duration::hours(2));
        due.crm_next_retry_at = Some(now - chrono::Duration::minutes(5));
        db.insert_booking(&due, 100, 0).await.unwrap();

        let lead2 = Lead::new("t1", "+15551230001", LeadSource::WebForm, 0);
        db.insert_lead(&lead2).await.unwrap();
        let mut future = Booking::new(lead2.id, "t1", now, now + chrono::Duration::hours(2));
        future.crm_next_retry_at = Some(now + chrono::Duration::hours(1));
        db.insert_booking(&future, 100, 0).await.unwrap();

        let rows = db.due_crm_syncs(now, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, due.id);
    }

    #[tokio::test]
    async fn abandoned_bookings_never_selected() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;
        let now = Utc::now();

        let booking = Booking::new(lead.id, "t1", now, now + chrono::Duration::hours(2));
        db.insert_booking(&booking, 100, 0).await.unwrap();
        db.record_crm_failure(booking.id, 5, None, true).await.unwrap();

        assert!(db.due_crm_syncs(now, 10).await.unwrap().is_empty());
        let active = db.get_active_booking(lead.id).await.unwrap().unwrap();
        assert_eq!(active.crm_sync_status, CrmSyncStatus::Abandoned);
    }

    #[tokio::test]
    async fn single_active_booking_per_lead() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;
        let now = Utc::now();

        let first = Booking::new(lead.id, "t1", now, now + chrono::Duration::hours(2));
        db.insert_booking(&first, 100, 0).await.unwrap();

        let second = Booking::new(lead.id, "t1", now, now + chrono::Duration::hours(4));
        let err = db.insert_booking(&second, 100, 0).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn booking_insert_refused_at_daily_capacity() {
        let db = test_db().await;
        let first_lead = seed_lead(&db).await;
        let second_lead = Lead::new("t1", "+15551230001", LeadSource::WebForm, 0);
        db.insert_lead(&second_lead).await.unwrap();
        let day = Utc.with_ymd_and_hms(2025, 6, 10, 8, 0, 0).unwrap();

        let first = Booking::new(first_lead.id, "t1", day, day + chrono::Duration::hours(2));
        assert!(db.insert_booking(&first, 1, 0).await.unwrap());

        // Same local day, capacity 1: refused without an error.
        let same_day = Booking::new(
            second_lead.id,
            "t1",
            day + chrono::Duration::hours(4),
            day + chrono::Duration::hours(6),
        );
        assert!(!db.insert_booking(&same_day, 1, 0).await.unwrap());
        assert!(db.get_active_booking(second_lead.id).await.unwrap().is_none());

        // The next local day is open again.
        let next_day = Booking::new(
            second_lead.id,
            "t1",
            day + chrono::Duration::days(1),
            day + chrono::Duration::days(1) + chrono::Duration::hours(2),
        );
        assert!(db.insert_booking(&next_day, 1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn followup_lifecycle() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;
        let now = Utc::now();

        let due_id = db
            .schedule_followup(lead.id, FollowUpKind::Nudge, now - chrono::Duration::minutes(1))
            .await
            .unwrap();
        db.schedule_followup(lead.id, FollowUpKind::Reminder, now + chrono::Duration::hours(4))
            .await
            .unwrap();

        let due = db.due_followups(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, due_id);

        db.mark_followup_sent(due_id).await.unwrap();
        assert!(db.due_followups(now, 10).await.unwrap().is_empty());

        // The remaining pending reminder is cancelled.
        let cancelled = db.cancel_pending_followups(lead.id).await.unwrap();
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn event_log_round_trip() {
        let db = test_db().await;
        let lead = seed_lead(&db).await;

        let entry = EventLogEntry::new("t1", EventKind::OptOut, "STOP reply")
            .for_lead(lead.id)
            .with_duration_ms(3);
        db.append_event(&entry).await.unwrap();

        let events = db.events_for_lead(lead.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::OptOut);
        assert_eq!(events[0].detail, "STOP reply");
    }
}
