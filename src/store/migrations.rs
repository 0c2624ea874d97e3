//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                support_email TEXT NOT NULL,
                portal_enabled INTEGER NOT NULL DEFAULT 0,
                portal_base_url TEXT,
                ack_template TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (tenant_id, email)
            );
            CREATE INDEX IF NOT EXISTS idx_users_tenant ON users(tenant_id);

            CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL UNIQUE REFERENCES tenants(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                imap_host TEXT,
                imap_port INTEGER,
                smtp_host TEXT,
                smtp_port INTEGER,
                username TEXT,
                password TEXT,
                api_base_url TEXT,
                access_token TEXT,
                refresh_token TEXT,
                token_expires_at TEXT,
                connected INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                number TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sender_email TEXT NOT NULL,
                sender_name TEXT,
                external_message_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                priority TEXT NOT NULL DEFAULT 'low',
                escalation_count INTEGER NOT NULL DEFAULT 1,
                public_token TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_reply_at TEXT,
                escalated_at TEXT,
                resolved_at TEXT,
                UNIQUE (tenant_id, number),
                UNIQUE (tenant_id, public_token)
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_tenant ON tickets(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_tickets_hash ON tickets(tenant_id, content_hash);
            CREATE INDEX IF NOT EXISTS idx_tickets_sender ON tickets(tenant_id, sender_email);

            CREATE TABLE IF NOT EXISTS ticket_processed_ids (
                ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (ticket_id, external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_processed_ids_external
                ON ticket_processed_ids(external_id);

            CREATE TABLE IF NOT EXISTS ticket_comments (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                author_user_id TEXT,
                author_name TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ticket_comments_ticket ON ticket_comments(ticket_id);

            CREATE TABLE IF NOT EXISTS ticket_activities (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                activity_type TEXT NOT NULL,
                actor TEXT,
                detail TEXT NOT NULL,
                content TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ticket_activities_ticket ON ticket_activities(ticket_id);

            CREATE TABLE IF NOT EXISTS processed_emails (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                ticket_id TEXT,
                outcome TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                UNIQUE (tenant_id, external_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "notification_feed",
        sql: r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                ticket_id TEXT,
                body TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id, created_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
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
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "tenants",
            "users",
            "mailboxes",
            "tickets",
            "ticket_processed_ids",
            "ticket_comments",
            "ticket_activities",
            "processed_emails",
            "notifications",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        // Running again should not fail
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "notification_feed");
    }

    #[tokio::test]
    async fn ledger_unique_constraint_holds() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO tenants (id, name, support_email) VALUES ('t1', 'Acme', 'support@acme.test')",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO processed_emails (id, tenant_id, external_id, outcome, processed_at)
             VALUES ('p1', 't1', 'msg-1', 'created', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        // Same (tenant, external_id) must be rejected.
        let dup = conn
            .execute(
                "INSERT INTO processed_emails (id, tenant_id, external_id, outcome, processed_at)
                 VALUES ('p2', 't1', 'msg-1', 'skipped', '2026-01-01T00:00:01Z')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn ticket_number_unique_per_tenant() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute_batch(
            "INSERT INTO tenants (id, name, support_email) VALUES ('t1', 'Acme', 'support@acme.test');
             INSERT INTO tenants (id, name, support_email) VALUES ('t2', 'Globex', 'help@globex.test');",
        )
        .await
        .unwrap();

        let insert = "INSERT INTO tickets (id, tenant_id, number, subject, body, sender_email,
                external_message_id, content_hash, status, priority, public_token,
                created_at, updated_at)
             VALUES (?1, ?2, 'INC000001', 's', 'b', 'a@b.c', 'm', 'h', 'acknowledged', 'low',
                ?3, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')";

        conn.execute(insert, libsql::params!["k1", "t1", "INC000001_aa"])
            .await
            .unwrap();

        // Same number in another tenant is fine.
        conn.execute(insert, libsql::params!["k2", "t2", "INC000001_bb"])
            .await
            .unwrap();

        // Same number in the same tenant is rejected.
        let dup = conn
            .execute(insert, libsql::params!["k3", "t1", "INC000001_cc"])
            .await;
        assert!(dup.is_err());
    }
}
