use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction, postgres::PgListener};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    config::PgConfig,
    connection::establish_pool,
    error::{PgDaoError, PgResult},
    models::{ClaimedRow, EVENT_COLUMNS, EventRow, GameRow, to_db_int},
    schema::ensure_schema,
};
use crate::dao::{
    models::{
        EventKind, GameEntity, GameStatus, NewScheduledEvent, PendingCounts, RECALCULATED_KINDS,
        ReplaceOutcome, ScheduledEvent, StatusWrite, WakeHint,
    },
    schedule_store::{EventClaim, ScheduleStore, SchedulePlanner, WakeStream},
    storage::{StorageError, StorageResult},
};

/// PostgreSQL-backed [`ScheduleStore`] implementation.
#[derive(Clone)]
pub struct PostgresScheduleStore {
    inner: Arc<PgInner>,
}

struct PgInner {
    pool: RwLock<PgPool>,
    config: PgConfig,
}

impl PgInner {
    async fn ping(&self) -> PgResult<()> {
        let pool = self.pool.read().await.clone();
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|source| PgDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> PgResult<()> {
        let pool = establish_pool(&self.config).await?;
        let previous = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, pool)
        };
        previous.close().await;
        Ok(())
    }
}

impl PostgresScheduleStore {
    /// Connect, then create or upgrade the tables and triggers.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        let pool = establish_pool(&config).await?;
        ensure_schema(&pool, &config.wake_channel, config.near_term_horizon).await?;

        Ok(Self {
            inner: Arc::new(PgInner {
                pool: RwLock::new(pool),
                config,
            }),
        })
    }

    async fn pool(&self) -> PgPool {
        self.inner.pool.read().await.clone()
    }

    async fn replace(
        &self,
        mut game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> PgResult<ReplaceOutcome> {
        let pool = self.pool().await;
        let mut tx = pool
            .begin()
            .await
            .map_err(PgDaoError::query("replace_schedule"))?;
        let recalculated_kinds = RECALCULATED_KINDS
            .iter()
            .map(|kind| kind.to_string())
            .collect::<Vec<_>>();

        // Lock order is pending event rows, then the game. A claim holds one
        // event row and reaches the game only at commit.
        sqlx::query(
            "SELECT id FROM scheduled_events \
             WHERE game_id = $1 AND NOT applied AND kind = ANY($2) \
             FOR UPDATE",
        )
        .bind(game.id)
        .bind(recalculated_kinds.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(PgDaoError::query("lock_pending_events"))?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT status FROM game_sessions WHERE id = $1 FOR UPDATE")
                .bind(game.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(PgDaoError::query("lock_game"))?;
        let stored = stored.map(|status| status.parse::<GameStatus>()).transpose()?;
        game.status = status.resolve(&game, stored);
        let events = plan(&game);

        sqlx::query(
            "INSERT INTO game_sessions \
                (id, scheduled_at, expected_duration_minutes, reminder_minutes, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
                scheduled_at = EXCLUDED.scheduled_at, \
                expected_duration_minutes = EXCLUDED.expected_duration_minutes, \
                reminder_minutes = EXCLUDED.reminder_minutes, \
                status = EXCLUDED.status, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(game.id)
        .bind(game.scheduled_at)
        .bind(game.expected_duration_minutes.map(to_db_int))
        .bind(
            game.reminder_minutes
                .iter()
                .copied()
                .map(to_db_int)
                .collect::<Vec<_>>(),
        )
        .bind(game.status.as_str())
        .bind(game.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(PgDaoError::query("upsert_game"))?;

        let removed = sqlx::query(
            "DELETE FROM scheduled_events \
             WHERE game_id = $1 AND NOT applied AND kind = ANY($2)",
        )
        .bind(game.id)
        .bind(recalculated_kinds.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(PgDaoError::query("delete_pending_events"))?
        .rows_affected();

        let mut inserted = Vec::with_capacity(events.len());
        for event in events {
            if let Some(row) = insert_event(&mut tx, game.id, event).await? {
                inserted.push(row);
            }
        }

        tx.commit()
            .await
            .map_err(PgDaoError::query("replace_schedule"))?;

        Ok(ReplaceOutcome {
            game,
            removed,
            inserted,
        })
    }

    async fn delete_game(&self, game_id: Uuid) -> PgResult<bool> {
        let pool = self.pool().await;
        let result = sqlx::query("DELETE FROM game_sessions WHERE id = $1")
            .bind(game_id)
            .execute(&pool)
            .await
            .map_err(PgDaoError::query("delete_game"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_game(&self, game_id: Uuid) -> PgResult<Option<GameEntity>> {
        let pool = self.pool().await;
        let row: Option<GameRow> = sqlx::query_as(
            "SELECT id, scheduled_at, expected_duration_minutes, reminder_minutes, status, updated_at \
             FROM game_sessions WHERE id = $1",
        )
        .bind(game_id)
        .fetch_optional(&pool)
        .await
        .map_err(PgDaoError::query("find_game"))?;

        Ok(row.map(GameEntity::try_from).transpose()?)
    }

    async fn list_events(&self, game_id: Uuid) -> PgResult<Vec<ScheduledEvent>> {
        let pool = self.pool().await;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM scheduled_events \
             WHERE game_id = $1 ORDER BY due_at, created_at"
        ))
        .bind(game_id)
        .fetch_all(&pool)
        .await
        .map_err(PgDaoError::query("list_events"))?;

        decode_events(rows)
    }

    async fn schedule_event(
        &self,
        game_id: Uuid,
        event: NewScheduledEvent,
    ) -> PgResult<Option<ScheduledEvent>> {
        let pool = self.pool().await;
        let mut tx = pool
            .begin()
            .await
            .map_err(PgDaoError::query("schedule_event"))?;
        let row = insert_event(&mut tx, game_id, event).await?;
        tx.commit()
            .await
            .map_err(PgDaoError::query("schedule_event"))?;
        Ok(row)
    }

    async fn cancel_event(&self, game_id: Uuid, kind: EventKind) -> PgResult<bool> {
        let pool = self.pool().await;
        let result = sqlx::query(
            "DELETE FROM scheduled_events \
             WHERE game_id = $1 AND kind = $2 AND discriminant = $3 AND NOT applied",
        )
        .bind(game_id)
        .bind(kind.label())
        .bind(kind.discriminant())
        .execute(&pool)
        .await
        .map_err(PgDaoError::query("cancel_event"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_events(&self, now: OffsetDateTime, limit: usize) -> PgResult<Vec<ScheduledEvent>> {
        let pool = self.pool().await;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM scheduled_events \
             WHERE NOT applied AND due_at <= $1 \
             ORDER BY due_at LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&pool)
        .await
        .map_err(PgDaoError::query("due_events"))?;

        decode_events(rows)
    }

    async fn claim(&self, event_id: Uuid, now: OffsetDateTime) -> PgResult<Option<PgClaim>> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(PgDaoError::query("claim"))?;

        let row: Option<ClaimedRow> = sqlx::query_as(
            "SELECT e.id, e.game_id, e.kind, e.discriminant, e.due_at, e.applied, \
                    e.applied_at, e.created_at, g.status AS game_status \
             FROM scheduled_events e \
             JOIN game_sessions g ON g.id = e.game_id \
             WHERE e.id = $1 AND NOT e.applied AND e.due_at <= $2 \
             FOR UPDATE OF e SKIP LOCKED",
        )
        .bind(event_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(PgDaoError::query("claim"))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(PgDaoError::query("claim"))?;
            return Ok(None);
        };

        Ok(Some(PgClaim {
            tx,
            game_status: row.game_status.parse()?,
            event: ScheduledEvent::try_from(row.event)?,
        }))
    }

    async fn pending_counts(&self, now: OffsetDateTime) -> PgResult<PendingCounts> {
        let pool = self.pool().await;
        let (pending, overdue): (i64, i64) = sqlx::query_as(
            "SELECT count(*), count(*) FILTER (WHERE due_at <= $1) \
             FROM scheduled_events WHERE NOT applied",
        )
        .bind(now)
        .fetch_one(&pool)
        .await
        .map_err(PgDaoError::query("pending_counts"))?;

        Ok(PendingCounts {
            pending: pending.max(0) as u64,
            overdue: overdue.max(0) as u64,
        })
    }

    async fn listen(&self, channel: String) -> PgResult<WakeStream> {
        let pool = self.pool().await;
        let listen_err = |source| PgDaoError::Listen {
            channel: channel.clone(),
            source,
        };
        let mut listener = PgListener::connect_with(&pool).await.map_err(listen_err)?;
        listener.listen(&channel).await.map_err(listen_err)?;
        debug!(channel = %channel, "listening for schedule wake notifications");

        let stream = async_stream::stream! {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => match WakeHint::from_payload(notification.payload()) {
                        Ok(hint) => yield Ok(hint),
                        Err(err) => warn!(
                            error = %err,
                            payload = notification.payload(),
                            "ignoring undecodable wake payload"
                        ),
                    },
                    Ok(None) => {
                        yield Err(StorageError::from(PgDaoError::ListenerLost {
                            channel: channel.clone(),
                        }));
                        break;
                    }
                    Err(source) => {
                        yield Err(StorageError::from(PgDaoError::Listen {
                            channel: channel.clone(),
                            source,
                        }));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn insert_event(
    tx: &mut Transaction<'static, Postgres>,
    game_id: Uuid,
    event: NewScheduledEvent,
) -> PgResult<Option<ScheduledEvent>> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        "INSERT INTO scheduled_events (id, game_id, kind, discriminant, due_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (game_id, kind, discriminant) DO NOTHING \
         RETURNING {EVENT_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(game_id)
    .bind(event.kind.label())
    .bind(event.kind.discriminant())
    .bind(event.due_at)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|source| match &source {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            PgDaoError::MissingGame { id: game_id }
        }
        _ => PgDaoError::Query {
            operation: "insert_event",
            source,
        },
    })?;

    Ok(row.map(ScheduledEvent::try_from).transpose()?)
}

fn decode_events(rows: Vec<EventRow>) -> PgResult<Vec<ScheduledEvent>> {
    rows.into_iter()
        .map(|row| ScheduledEvent::try_from(row).map_err(PgDaoError::from))
        .collect()
}

/// Open transaction holding the row lock of one claimed event.
struct PgClaim {
    tx: Transaction<'static, Postgres>,
    event: ScheduledEvent,
    game_status: GameStatus,
}

impl PgClaim {
    async fn commit(mut self, apply_status: Option<GameStatus>) -> PgResult<bool> {
        let marked = sqlx::query(
            "UPDATE scheduled_events SET applied = TRUE, applied_at = now() WHERE id = $1",
        )
        .bind(self.event.id)
        .execute(&mut *self.tx)
        .await
        .map_err(PgDaoError::query("mark_applied"))?
        .rows_affected();

        if marked == 0 {
            self.tx
                .rollback()
                .await
                .map_err(PgDaoError::query("commit_claim"))?;
            return Ok(false);
        }

        if let Some(target) = apply_status {
            let allowed_from: Vec<String> = target
                .predecessors()
                .into_iter()
                .map(|status| status.as_str().to_owned())
                .collect();
            sqlx::query(
                "UPDATE game_sessions SET status = $2, updated_at = now() \
                 WHERE id = $1 AND status = ANY($3)",
            )
            .bind(self.event.game_id)
            .bind(target.as_str())
            .bind(allowed_from)
            .execute(&mut *self.tx)
            .await
            .map_err(PgDaoError::query("apply_status"))?;
        }

        self.tx
            .commit()
            .await
            .map_err(PgDaoError::query("commit_claim"))?;
        Ok(true)
    }
}

impl EventClaim for PgClaim {
    fn event(&self) -> &ScheduledEvent {
        &self.event
    }

    fn game_status(&self) -> GameStatus {
        self.game_status
    }

    fn commit(
        self: Box<Self>,
        apply_status: Option<GameStatus>,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        Box::pin(async move { (*self).commit(apply_status).await.map_err(Into::into) })
    }

    fn release(self: Box<Self>) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async move {
            self.tx
                .rollback()
                .await
                .map_err(PgDaoError::query("release_claim"))
                .map_err(Into::into)
        })
    }
}

impl ScheduleStore for PostgresScheduleStore {
    fn replace_schedule(
        &self,
        game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> BoxFuture<'static, StorageResult<ReplaceOutcome>> {
        let store = self.clone();
        Box::pin(async move { store.replace(game, status, plan).await.map_err(Into::into) })
    }

    fn delete_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.delete_game(game_id).await.map_err(Into::into) })
    }

    fn find_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Option<GameEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_game(game_id).await.map_err(Into::into) })
    }

    fn list_events(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move { store.list_events(game_id).await.map_err(Into::into) })
    }

    fn schedule_event(
        &self,
        game_id: Uuid,
        event: NewScheduledEvent,
    ) -> BoxFuture<'static, StorageResult<Option<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .schedule_event(game_id, event)
                .await
                .map_err(Into::into)
        })
    }

    fn cancel_event(
        &self,
        game_id: Uuid,
        kind: EventKind,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.cancel_event(game_id, kind).await.map_err(Into::into) })
    }

    fn due_events(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move { store.due_events(now, limit).await.map_err(Into::into) })
    }

    fn claim(
        &self,
        event_id: Uuid,
        now: OffsetDateTime,
    ) -> BoxFuture<'static, StorageResult<Option<Box<dyn EventClaim>>>> {
        let store = self.clone();
        Box::pin(async move {
            let claim = store.claim(event_id, now).await?;
            Ok(claim.map(|claim| Box::new(claim) as Box<dyn EventClaim>))
        })
    }

    fn pending_counts(&self, now: OffsetDateTime) -> BoxFuture<'static, StorageResult<PendingCounts>> {
        let store = self.clone();
        Box::pin(async move { store.pending_counts(now).await.map_err(Into::into) })
    }

    fn listen(&self, channel: String) -> BoxFuture<'static, StorageResult<Option<WakeStream>>> {
        let store = self.clone();
        Box::pin(async move { Ok(Some(store.listen(channel).await?)) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
