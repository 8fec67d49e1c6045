use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dao::models::{EventKind, GameEntity, NewScheduledEvent, ScheduledEvent, StatusWrite},
    dto::schedule::{GameScheduleView, ScheduleGameRequest, ScheduleSummary, ScheduledEventView},
    error::ServiceError,
    services::recalculator::{self, Recalculation},
    state::SharedState,
};

/// Which scheduling fields an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangedFields {
    /// Start time moved.
    pub scheduled_at: bool,
    /// Expected duration set, changed or cleared.
    pub expected_duration: bool,
    /// Reminder offsets changed.
    pub reminder_minutes: bool,
    /// The caller set a new status; otherwise the stored one is kept.
    pub status: bool,
}

impl ChangedFields {
    /// Every field, for callers that cannot tell.
    pub fn all() -> Self {
        Self {
            scheduled_at: true,
            expected_duration: true,
            reminder_minutes: true,
            status: true,
        }
    }

    /// Fields that differ between the stored game and the incoming one.
    pub fn between(previous: &GameEntity, next: &GameEntity) -> Self {
        Self {
            scheduled_at: previous.scheduled_at != next.scheduled_at,
            expected_duration: previous.expected_duration_minutes
                != next.expected_duration_minutes,
            reminder_minutes: previous.reminder_minutes != next.reminder_minutes,
            status: previous.status != next.status,
        }
    }

    /// Whether anything the schedule depends on changed.
    pub fn any(&self) -> bool {
        self.scheduled_at || self.expected_duration || self.reminder_minutes || self.status
    }
}

/// Create or update hook behind `PUT /games/{id}/schedule`.
///
/// The stored game read here only decides which hook runs. An omitted status
/// is resolved again by the store under its write lock.
pub async fn upsert_game_schedule(
    state: &SharedState,
    game_id: Uuid,
    request: ScheduleGameRequest,
) -> Result<ScheduleSummary, ServiceError> {
    let store = state.require_schedule_store().await?;
    let now = OffsetDateTime::now_utc();

    match store.find_game(game_id).await? {
        Some(previous) => {
            let game = request.into_entity(game_id, Some(previous.status), now);
            let changed = ChangedFields::between(&previous, &game);
            on_game_updated(state, game, changed).await
        }
        None => on_game_created(state, request.into_entity(game_id, None, now)).await,
    }
}

/// A game was created: compute and store its schedule.
pub async fn on_game_created(
    state: &SharedState,
    game: GameEntity,
) -> Result<ScheduleSummary, ServiceError> {
    info!(game_id = %game.id, "scheduling new game");
    apply_schedule(state, game, StatusWrite::Overwrite).await
}

/// A game changed. Recalculates only when a scheduling field moved, and only
/// writes `game.status` when `changed.status` says the caller set it.
pub async fn on_game_updated(
    state: &SharedState,
    game: GameEntity,
    changed: ChangedFields,
) -> Result<ScheduleSummary, ServiceError> {
    if changed.any() {
        info!(game_id = %game.id, ?changed, "rescheduling updated game");
        let status = if changed.status {
            StatusWrite::Overwrite
        } else {
            StatusWrite::KeepStored
        };
        return apply_schedule(state, game, status).await;
    }

    debug!(game_id = %game.id, "no scheduling field changed; keeping schedule");
    let store = state.require_schedule_store().await?;
    let events = store.list_events(game.id).await?;
    Ok(ScheduleSummary {
        game_id: game.id,
        status: game.status,
        removed: 0,
        inserted: 0,
        overdue: 0,
        events: views(events),
    })
}

/// A game was deleted; its rows go with it.
pub async fn on_game_deleted(state: &SharedState, game_id: Uuid) -> Result<(), ServiceError> {
    let store = state.require_schedule_store().await?;
    if !store.delete_game(game_id).await? {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    }

    info!(%game_id, "game deleted with its schedule");
    Ok(())
}

/// Every row of a game, pending and applied, ordered by due time.
pub async fn list_schedule(
    state: &SharedState,
    game_id: Uuid,
) -> Result<GameScheduleView, ServiceError> {
    let store = state.require_schedule_store().await?;
    let Some(game) = store.find_game(game_id).await? else {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    };
    let events = store.list_events(game_id).await?;

    Ok(GameScheduleView {
        game_id,
        status: game.status,
        scheduled_at: game.scheduled_at,
        events: views(events),
    })
}

/// Schedule a join notification `join_notification_delay` from now.
pub async fn schedule_join_notification(
    state: &SharedState,
    game_id: Uuid,
    participant_id: String,
) -> Result<ScheduledEventView, ServiceError> {
    recalculator::validate_participant(&participant_id)?;

    let store = state.require_schedule_store().await?;
    if store.find_game(game_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    }

    let now = OffsetDateTime::now_utc();
    let event = NewScheduledEvent {
        kind: EventKind::JoinNotification {
            participant_id: participant_id.clone(),
        },
        due_at: now + state.config().join_notification_delay,
    };

    let Some(stored) = store.schedule_event(game_id, event).await? else {
        return Err(ServiceError::Conflict(format!(
            "participant `{participant_id}` already has a join notification for game `{game_id}`"
        )));
    };

    info!(%game_id, event_id = %stored.id, due_at = %stored.due_at, "join notification scheduled");
    publish_hints(state, std::slice::from_ref(&stored), now);
    Ok(stored.into())
}

/// Drop a pending join notification.
pub async fn cancel_join_notification(
    state: &SharedState,
    game_id: Uuid,
    participant_id: String,
) -> Result<(), ServiceError> {
    let store = state.require_schedule_store().await?;
    let kind = EventKind::JoinNotification { participant_id };
    if !store.cancel_event(game_id, kind.clone()).await? {
        return Err(ServiceError::NotFound(format!(
            "no pending join notification for `{}` in game `{game_id}`",
            kind.discriminant()
        )));
    }

    info!(%game_id, participant_id = %kind.discriminant(), "join notification cancelled");
    Ok(())
}

async fn apply_schedule(
    state: &SharedState,
    game: GameEntity,
    status: StatusWrite,
) -> Result<ScheduleSummary, ServiceError> {
    let store = state.require_schedule_store().await?;
    let now = OffsetDateTime::now_utc();
    let game_id = game.id;

    let Recalculation { outcome, overdue } =
        recalculator::recalculate(store.as_ref(), game, status, now).await?;
    publish_hints(state, &outcome.inserted, now);

    let events = store.list_events(game_id).await?;
    Ok(ScheduleSummary {
        game_id,
        status: outcome.game.status,
        removed: outcome.removed,
        inserted: outcome.inserted.len(),
        overdue,
        events: views(events),
    })
}

/// Commit-ordered wake for rows this process just wrote.
fn publish_hints(state: &SharedState, events: &[ScheduledEvent], now: OffsetDateTime) {
    let woken = state
        .wake_hub()
        .publish_near_term(events, now, state.config().near_term_horizon);
    if woken > 0 {
        debug!(woken, "published near-term wake hints");
    }
}

fn views(events: Vec<ScheduledEvent>) -> Vec<ScheduledEventView> {
    events.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::Duration;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{models::GameStatus, schedule_store::MemoryScheduleStore},
        state::{AppState, WakeSignal},
    };

    async fn state() -> SharedState {
        let state = AppState::new(AppConfig::default());
        state
            .install_schedule_store(Arc::new(MemoryScheduleStore::new()))
            .await;
        state
    }

    fn request(start: OffsetDateTime, reminders: Vec<u32>) -> ScheduleGameRequest {
        ScheduleGameRequest {
            scheduled_at: start,
            expected_duration_minutes: None,
            reminder_minutes: reminders,
            status: None,
        }
    }

    #[tokio::test]
    async fn unchanged_update_keeps_row_identities() {
        let state = state().await;
        let game_id = Uuid::new_v4();
        let start = OffsetDateTime::now_utc() + Duration::hours(2);

        let first = upsert_game_schedule(&state, game_id, request(start, vec![30]))
            .await
            .unwrap();
        let second = upsert_game_schedule(&state, game_id, request(start, vec![30]))
            .await
            .unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(first.events, second.events);
    }

    #[tokio::test]
    async fn near_term_rows_wake_the_daemon() {
        let state = state().await;
        let mut wake = state.wake_hub().subscribe();
        let start = OffsetDateTime::now_utc() + Duration::minutes(5);

        upsert_game_schedule(&state, Uuid::new_v4(), request(start, vec![60, 240]))
            .await
            .unwrap();

        // Both reminders are overdue and the start is five minutes out.
        let mut hints = 0;
        while let Ok(WakeSignal::Hint(_)) = wake.try_recv() {
            hints += 1;
        }
        assert_eq!(hints, 3);
    }

    #[tokio::test]
    async fn invalid_configuration_writes_nothing() {
        let state = state().await;
        let game_id = Uuid::new_v4();
        let start = OffsetDateTime::now_utc() + Duration::hours(1);

        let err = upsert_game_schedule(&state, game_id, request(start, vec![0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert!(matches!(
            list_schedule(&state, game_id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_a_game_clears_pending_rows() {
        let state = state().await;
        let game_id = Uuid::new_v4();
        let start = OffsetDateTime::now_utc() + Duration::hours(1);
        upsert_game_schedule(&state, game_id, request(start, vec![15]))
            .await
            .unwrap();

        let mut cancelled = request(start, vec![15]);
        cancelled.status = Some(GameStatus::Cancelled);
        let summary = upsert_game_schedule(&state, game_id, cancelled)
            .await
            .unwrap();

        assert_eq!(summary.status, GameStatus::Cancelled);
        assert_eq!(summary.removed, 2);
        assert!(summary.events.is_empty());
    }

    #[tokio::test]
    async fn degraded_mode_rejects_hooks() {
        let state = AppState::new(AppConfig::default());
        let err = on_game_deleted(&state, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }
}
