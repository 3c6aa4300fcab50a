//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            name TEXT,
            email TEXT,
            address TEXT,
            source TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'new',
            score INTEGER,
            tz_offset_minutes INTEGER NOT NULL DEFAULT 0,
            first_response_at TEXT,
            state_entered_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, phone)
        );
        CREATE INDEX IF NOT EXISTS idx_leads_state ON leads(state);
        CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);

        CREATE TABLE IF NOT EXISTS consent_records (
            tenant_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            opted_out INTEGER NOT NULL DEFAULT 0,
            opted_out_at TEXT,
            opt_out_source TEXT,
            re_opted_in_at TEXT,
            re_opt_in_actor TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, phone)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            direction TEXT NOT NULL,
            content TEXT NOT NULL,
            agent_id TEXT,
            delivery_status TEXT,
            provider_message_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id);
        CREATE INDEX IF NOT EXISTS idx_messages_provider_id
            ON messages(provider_message_id);

        CREATE TABLE IF NOT EXISTS bookings (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            tenant_id TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'confirmed',
            technician TEXT,
            crm_sync_status TEXT NOT NULL DEFAULT 'pending',
            crm_retry_count INTEGER NOT NULL DEFAULT 0,
            crm_next_retry_at TEXT,
            crm_customer_id TEXT,
            crm_booking_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bookings_lead ON bookings(lead_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_active
            ON bookings(lead_id) WHERE status = 'confirmed';
        CREATE INDEX IF NOT EXISTS idx_bookings_sync
            ON bookings(crm_sync_status, crm_next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_bookings_tenant_window
            ON bookings(tenant_id, window_start);

        CREATE TABLE IF NOT EXISTS followups (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            kind TEXT NOT NULL,
            due_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            sent_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_followups_due ON followups(status, due_at);
        CREATE INDEX IF NOT EXISTS idx_followups_lead ON followups(lead_id);

        CREATE TABLE IF NOT EXISTS cold_counters (
            lead_id TEXT PRIMARY KEY REFERENCES leads(id),
            used INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event_log (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            lead_id TEXT,
            kind TEXT NOT NULL,
            detail TEXT NOT NULL,
            duration_ms INTEGER,
            cost TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_event_log_lead ON event_log(lead_id);
        CREATE INDEX IF NOT EXISTS idx_event_log_kind ON event_log(kind);
    "#,
}];

/// Apply all migrations newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("failed to create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, datetime('now'))",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "failed to record migration {}: {e}",
                migration.version
            ))
        })?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("failed to read version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("failed to read version row: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("bad version column: {e}"))),
        None => Ok(0),
    }
}
