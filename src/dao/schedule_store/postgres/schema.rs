use std::time::Duration;

use sqlx::{Executor, PgPool};

use super::error::{PgDaoError, PgResult};

/// Serializes concurrent schema setup across replicas.
const SCHEMA_LOCK_KEY: i64 = 0x6761_6d65_5f73_6368;

/// DDL for both tables, their indexes, the applied-row freeze and the wake
/// trigger. Every statement is idempotent.
pub fn schema_sql(channel: &str, horizon: Duration) -> String {
    let horizon_secs = horizon.as_secs();
    format!(
        r#"
CREATE TABLE IF NOT EXISTS game_sessions (
    id UUID PRIMARY KEY,
    scheduled_at TIMESTAMPTZ NOT NULL,
    expected_duration_minutes INTEGER CHECK (expected_duration_minutes > 0),
    reminder_minutes INTEGER[] NOT NULL DEFAULT '{{}}',
    status TEXT NOT NULL DEFAULT 'SCHEDULED'
        CHECK (status IN ('SCHEDULED', 'IN_PROGRESS', 'COMPLETED', 'CANCELLED')),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS scheduled_events (
    id UUID PRIMARY KEY,
    game_id UUID NOT NULL REFERENCES game_sessions (id) ON DELETE CASCADE,
    kind TEXT NOT NULL
        CHECK (kind IN ('reminder', 'status_transition', 'join_notification')),
    discriminant TEXT NOT NULL,
    due_at TIMESTAMPTZ NOT NULL,
    applied BOOLEAN NOT NULL DEFAULT FALSE,
    applied_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT scheduled_events_key UNIQUE (game_id, kind, discriminant)
);

CREATE INDEX IF NOT EXISTS scheduled_events_pending_due_idx
    ON scheduled_events (due_at) WHERE NOT applied;
CREATE INDEX IF NOT EXISTS scheduled_events_game_idx
    ON scheduled_events (game_id);

CREATE OR REPLACE FUNCTION scheduled_events_freeze_applied() RETURNS trigger AS $$
BEGIN
    IF OLD.applied THEN
        RAISE EXCEPTION 'scheduled event % is already applied', OLD.id;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE TRIGGER scheduled_events_freeze_applied
    BEFORE UPDATE ON scheduled_events
    FOR EACH ROW EXECUTE FUNCTION scheduled_events_freeze_applied();

CREATE OR REPLACE FUNCTION scheduled_events_wake() RETURNS trigger AS $$
DECLARE
    affected scheduled_events%ROWTYPE;
BEGIN
    IF TG_OP = 'DELETE' THEN
        affected := OLD;
    ELSE
        affected := NEW;
    END IF;

    IF NOT affected.applied
        AND affected.due_at <= now() + make_interval(secs => {horizon_secs}) THEN
        PERFORM pg_notify(
            '{channel}',
            json_build_object(
                'operation', TG_OP,
                'game_id', affected.game_id,
                'due_at', affected.due_at
            )::text
        );
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE TRIGGER scheduled_events_wake
    AFTER INSERT OR UPDATE OR DELETE ON scheduled_events
    FOR EACH ROW EXECUTE FUNCTION scheduled_events_wake();
"#
    )
}

/// Create or upgrade the schema in a single locked transaction.
pub async fn ensure_schema(pool: &PgPool, channel: &str, horizon: Duration) -> PgResult<()> {
    let map_err = |source| PgDaoError::EnsureSchema { source };
    let ddl = schema_sql(channel, horizon);

    let mut tx = pool.begin().await.map_err(map_err)?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
    (&mut *tx).execute(sqlx::raw_sql(&ddl)).await.map_err(map_err)?;
    tx.commit().await.map_err(map_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_trigger_uses_configured_channel_and_horizon() {
        let ddl = schema_sql("game_wake", Duration::from_secs(300));
        assert!(ddl.contains("pg_notify(\n            'game_wake'"));
        assert!(ddl.contains("make_interval(secs => 300)"));
        assert!(ddl.contains("DEFAULT '{}'"));
        assert!(ddl.contains("ON DELETE CASCADE"));
    }
}
