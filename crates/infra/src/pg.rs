//! Postgres plumbing shared by the sqlx-backed stores.
//!
//! ## Sync traits over an async driver
//!
//! The store traits are synchronous and are driven from plain worker
//! threads. Each Postgres store keeps the [`Handle`](tokio::runtime::Handle) of the runtime that
//! owns its pool and bridges with `Handle::block_on`. Calling a store
//! method from inside an async task panics; call it from a blocking
//! context (`std::thread`, `spawn_blocking`).
//!
//! ## Error mapping
//!
//! | SQLx error | SQLSTATE | Mapped to |
//! |---|---|---|
//! | Database (unique violation) | `23505` | conflict |
//! | Database (check violation) | `23514` | storage (rejected row) |
//! | anything else | n/a | storage |

use sqlx::PgPool;
use tracing::info;

/// Schema for wallets, the outbox and saga instances.
///
/// Every statement is idempotent so [`ensure_schema`] can run on each start.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        id          UUID PRIMARY KEY,
        user_id     UUID NOT NULL,
        balance     NUMERIC(38, 18) NOT NULL CHECK (balance >= 0),
        version     BIGINT NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id              BIGSERIAL PRIMARY KEY,
        event_type      TEXT NOT NULL,
        payload         TEXT NOT NULL,
        correlation_id  TEXT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        sent            BOOLEAN NOT NULL DEFAULT FALSE,
        sent_at         TIMESTAMPTZ NULL,
        claimed_by      TEXT NULL,
        claimed_until   TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_unsent_idx
        ON outbox_events (created_at, id) WHERE sent = FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_correlation_idx
        ON outbox_events (correlation_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saga_instances (
        correlation_id  TEXT PRIMARY KEY,
        current_state   TEXT NOT NULL,
        extended_state  JSONB NOT NULL DEFAULT '{}'::jsonb,
        version         BIGINT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS saga_instances_state_idx
        ON saga_instances (current_state, updated_at)
    "#,
];

/// Create missing tables and indexes.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database schema ensured");
    Ok(())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Human-readable description used in mapped errors.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {operation}: {}", db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_are_rerunnable() {
        for statement in SCHEMA {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement would fail on restart: {statement}"
            );
        }
    }

    #[test]
    fn outbox_has_a_partial_index_on_unsent_rows() {
        assert!(SCHEMA
            .iter()
            .any(|s| s.contains("ON outbox_events") && s.contains("WHERE sent = FALSE")));
    }
}
