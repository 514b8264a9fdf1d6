//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones, in order.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS visitors (
                id TEXT PRIMARY KEY,
                email_hash TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                abandonment_step INTEGER NOT NULL,
                abandoned INTEGER NOT NULL DEFAULT 0,
                phone_number TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                credit_status TEXT,
                lead_ready_step INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_visitors_activity ON visitors(abandoned, last_activity_at);

            CREATE TABLE IF NOT EXISTS visitor_contacts (
                visitor_id TEXT PRIMARY KEY REFERENCES visitors(id),
                address TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS return_tokens (
                value TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                abandonment_step INTEGER NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                redeemed_at TEXT,
                message_sent INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_return_tokens_visitor ON return_tokens(visitor_id, issued_at);

            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                action TEXT NOT NULL,
                target_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_activity_target ON activity_log(target_id);
        "#,
    },
    Migration {
        version: 2,
        name: "leads_and_dead_letters",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                credit_check_id TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                external_reference TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                submitted_at TEXT,
                UNIQUE (visitor_id, credit_check_id)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);

            CREATE TABLE IF NOT EXISTS dead_letters (
                lead_id TEXT PRIMARY KEY REFERENCES leads(id),
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                dead_lettered_at TEXT NOT NULL,
                resolved_at TEXT
            );
        "#,
    },
    Migration {
        version: 3,
        name: "visitor_versions_dispatch_claims_sealed_contacts",
        // Clear-text addresses from V1 are dropped, not migrated.
        sql: r#"
            ALTER TABLE visitors ADD COLUMN version INTEGER NOT NULL DEFAULT 0;

            ALTER TABLE return_tokens ADD COLUMN dispatch_claimed_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_return_tokens_live ON return_tokens(visitor_id, abandonment_step, used, expires_at);

            DROP TABLE IF EXISTS visitor_contacts;
            CREATE TABLE visitor_contacts (
                visitor_id TEXT PRIMARY KEY REFERENCES visitors(id),
                sealed_address TEXT NOT NULL
            );
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
