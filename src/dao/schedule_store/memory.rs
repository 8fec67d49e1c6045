//! In-process [`ScheduleStore`] used by tests and single-node development runs.
//!
//! Claimed rows are tracked in a set and skipped by other claims until the
//! holder commits, releases or drops its claim, like `FOR UPDATE SKIP LOCKED`.
//! A replace leaves claimed rows in place, the way a row lock would hold it off.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::BoxFuture;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dao::{
    models::{
        EventKind, GameEntity, GameStatus, NewScheduledEvent, PendingCounts, ReplaceOutcome,
        ScheduledEvent, StatusWrite,
    },
    schedule_store::{EventClaim, ScheduleStore, SchedulePlanner, WakeStream},
    storage::{StorageError, StorageResult},
};

/// Memory-backed [`ScheduleStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryScheduleStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    games: HashMap<Uuid, GameEntity>,
    events: HashMap<Uuid, ScheduledEvent>,
    claimed: HashSet<Uuid>,
}

impl MemoryState {
    fn key_taken(&self, game_id: Uuid, kind: &EventKind) -> bool {
        let key = kind.unique_key();
        self.events
            .values()
            .any(|row| row.game_id == game_id && row.kind.unique_key() == key)
    }

    fn events_of(&self, game_id: Uuid) -> Vec<ScheduledEvent> {
        let mut rows: Vec<_> = self
            .events
            .values()
            .filter(|row| row.game_id == game_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.due_at, row.created_at));
        rows
    }

    fn insert_pending(&mut self, game_id: Uuid, event: NewScheduledEvent) -> Option<ScheduledEvent> {
        if self.key_taken(game_id, &event.kind) {
            return None;
        }
        let row = ScheduledEvent::pending(game_id, event, OffsetDateTime::now_utc());
        self.events.insert(row.id, row.clone());
        Some(row)
    }
}

impl MemoryScheduleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace(
        &self,
        mut game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> ReplaceOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let game_id = game.id;
        let stored = state.games.get(&game_id).map(|stored| stored.status);
        game.status = status.resolve(&game, stored);
        let events = plan(&game);
        state.games.insert(game_id, game.clone());

        // Claimed rows stay until their holder settles them.
        let claimed = &state.claimed;
        let before = state.events.len();
        state.events.retain(|id, row| {
            row.game_id != game_id
                || row.applied
                || !row.kind.is_recalculated()
                || claimed.contains(id)
        });
        let removed = (before - state.events.len()) as u64;

        let inserted = events
            .into_iter()
            .filter_map(|event| state.insert_pending(game_id, event))
            .collect();

        ReplaceOutcome {
            game,
            removed,
            inserted,
        }
    }

    fn claim_row(&self, event_id: Uuid, now: OffsetDateTime) -> Option<MemoryClaim> {
        let mut state = self.lock();
        if state.claimed.contains(&event_id) {
            return None;
        }
        let event = state.events.get(&event_id).filter(|row| row.is_due(now))?.clone();
        let game_status = state.games.get(&event.game_id)?.status;
        state.claimed.insert(event_id);

        Some(MemoryClaim {
            store: self.clone(),
            event,
            game_status,
        })
    }

    fn settle(&self, event: &ScheduledEvent, apply_status: Option<GameStatus>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.claimed.remove(&event.id);

        // Gone with its game.
        let Some(row) = state.events.get_mut(&event.id) else {
            return false;
        };
        let now = OffsetDateTime::now_utc();
        row.applied = true;
        row.applied_at = Some(now);

        if let Some(target) = apply_status
            && let Some(game) = state.games.get_mut(&event.game_id)
            && game.status.can_transition_to(target)
        {
            game.status = target;
            game.updated_at = now;
        }
        true
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn replace_schedule(
        &self,
        game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> BoxFuture<'static, StorageResult<ReplaceOutcome>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.replace(game, status, plan)) })
    }

    fn delete_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.lock();
            let existed = state.games.remove(&game_id).is_some();
            state.events.retain(|_, row| row.game_id != game_id);
            Ok(existed)
        })
    }

    fn find_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Option<GameEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.lock().games.get(&game_id).cloned()) })
    }

    fn list_events(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.lock().events_of(game_id)) })
    }

    fn schedule_event(
        &self,
        game_id: Uuid,
        event: NewScheduledEvent,
    ) -> BoxFuture<'static, StorageResult<Option<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.lock();
            if !state.games.contains_key(&game_id) {
                return Err(StorageError::conflict(format!(
                    "game `{game_id}` does not exist"
                )));
            }
            Ok(state.insert_pending(game_id, event))
        })
    }

    fn cancel_event(
        &self,
        game_id: Uuid,
        kind: EventKind,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let mut state = store.lock();
            let target = state
                .events
                .values()
                .find(|row| row.game_id == game_id && !row.applied && row.kind == kind)
                .map(|row| row.id);
            Ok(target.and_then(|id| state.events.remove(&id)).is_some())
        })
    }

    fn due_events(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.lock();
            let mut due: Vec<_> = state
                .events
                .values()
                .filter(|row| row.is_due(now))
                .cloned()
                .collect();
            due.sort_by_key(|row| row.due_at);
            due.truncate(limit);
            Ok(due)
        })
    }

    fn claim(
        &self,
        event_id: Uuid,
        now: OffsetDateTime,
    ) -> BoxFuture<'static, StorageResult<Option<Box<dyn EventClaim>>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .claim_row(event_id, now)
                .map(|claim| Box::new(claim) as Box<dyn EventClaim>))
        })
    }

    fn pending_counts(&self, now: OffsetDateTime) -> BoxFuture<'static, StorageResult<PendingCounts>> {
        let store = self.clone();
        Box::pin(async move {
            let state = store.lock();
            let counts = state
                .events
                .values()
                .filter(|row| !row.applied)
                .fold(PendingCounts::default(), |mut counts, row| {
                    counts.pending += 1;
                    if row.due_at <= now {
                        counts.overdue += 1;
                    }
                    counts
                });
            Ok(counts)
        })
    }

    fn listen(&self, _channel: String) -> BoxFuture<'static, StorageResult<Option<WakeStream>>> {
        Box::pin(async { Ok(None) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Claim on one row. Changes only land on commit; the row is unlocked on drop.
struct MemoryClaim {
    store: MemoryScheduleStore,
    event: ScheduledEvent,
    game_status: GameStatus,
}

impl EventClaim for MemoryClaim {
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
        Box::pin(async move { Ok(self.store.settle(&self.event, apply_status)) })
    }

    fn release(self: Box<Self>) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.store.lock().claimed.remove(&self.event.id);
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::dao::schedule_store::fixed_plan;

    fn game(scheduled_at: OffsetDateTime) -> GameEntity {
        GameEntity {
            id: Uuid::new_v4(),
            scheduled_at,
            expected_duration_minutes: Some(90),
            reminder_minutes: vec![60, 15],
            status: GameStatus::Scheduled,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn reminder(offset_minutes: u32, due_at: OffsetDateTime) -> NewScheduledEvent {
        NewScheduledEvent {
            kind: EventKind::Reminder { offset_minutes },
            due_at,
        }
    }

    async fn write(
        store: &MemoryScheduleStore,
        game: GameEntity,
        events: Vec<NewScheduledEvent>,
    ) -> ReplaceOutcome {
        store
            .replace_schedule(game, StatusWrite::Overwrite, fixed_plan(events))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replace_swaps_pending_rows_and_keeps_applied_history() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let game = game(now + Duration::hours(2));

        let first = write(&store, game.clone(), vec![reminder(60, now), reminder(15, now)]).await;
        assert_eq!(first.inserted.len(), 2);

        let sent = first.inserted[0].clone();
        let claim = store.claim(sent.id, now).await.unwrap().unwrap();
        assert!(claim.commit(None).await.unwrap());

        let second = write(
            &store,
            game.clone(),
            vec![reminder(60, now + Duration::hours(1)), reminder(30, now)],
        )
        .await;
        assert_eq!(second.removed, 1);
        assert_eq!(second.inserted.len(), 1, "sent offset is not scheduled again");

        let rows = store.list_events(game.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.id == sent.id && row.applied));
        assert!(
            rows.iter()
                .any(|row| row.kind == EventKind::Reminder { offset_minutes: 30 } && !row.applied)
        );
    }

    #[tokio::test]
    async fn claimed_row_survives_a_replace_and_is_not_sent_twice() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let game = game(now + Duration::minutes(30));
        let row = write(&store, game.clone(), vec![reminder(60, now)])
            .await
            .inserted
            .remove(0);

        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        let replaced = write(&store, game.clone(), vec![reminder(60, now)]).await;
        assert_eq!(replaced.removed, 0);
        assert!(replaced.inserted.is_empty(), "claimed key stays taken");

        assert!(claim.commit(None).await.unwrap());
        assert!(store.due_events(now, 10).await.unwrap().is_empty());
        let rows = store.list_events(game.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].applied);
    }

    #[tokio::test]
    async fn released_claim_is_replaced_on_the_next_recalculation() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let game = game(now + Duration::minutes(30));
        let row = write(&store, game.clone(), vec![reminder(60, now)])
            .await
            .inserted
            .remove(0);

        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        write(&store, game.clone(), vec![reminder(60, now)]).await;
        claim.release().await.unwrap();

        let later = now + Duration::minutes(5);
        let replaced = write(&store, game.clone(), vec![reminder(60, later)]).await;
        assert_eq!(replaced.removed, 1);
        assert_eq!(replaced.inserted[0].due_at, later);
    }

    #[tokio::test]
    async fn commit_reports_a_row_deleted_with_its_game() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let mut game = game(now);
        game.expected_duration_minutes = None;
        let transition = NewScheduledEvent {
            kind: EventKind::StatusTransition {
                target: GameStatus::InProgress,
            },
            due_at: now - Duration::seconds(1),
        };
        let row = write(&store, game.clone(), vec![transition])
            .await
            .inserted
            .remove(0);

        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        assert!(store.delete_game(game.id).await.unwrap());

        assert!(!claim.commit(Some(GameStatus::InProgress)).await.unwrap());
        assert!(store.find_game(game.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_stored_status_ignores_the_carried_one() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let mut game = game(now + Duration::hours(1));
        game.status = GameStatus::InProgress;
        write(&store, game.clone(), vec![]).await;

        game.status = GameStatus::Scheduled;
        let seen = Arc::new(Mutex::new(None));
        let planned = seen.clone();
        let outcome = store
            .replace_schedule(
                game.clone(),
                StatusWrite::KeepStored,
                Box::new(move |stored: &GameEntity| {
                    *planned.lock().unwrap() = Some(stored.status);
                    Vec::new()
                }),
            )
            .await
            .unwrap();

        assert_eq!(outcome.game.status, GameStatus::InProgress);
        assert_eq!(*seen.lock().unwrap(), Some(GameStatus::InProgress));
        let stored = store.find_game(game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::InProgress);
    }

    #[tokio::test]
    async fn deleting_a_game_cascades() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let game = game(now);
        write(&store, game.clone(), vec![reminder(5, now)]).await;

        assert!(store.delete_game(game.id).await.unwrap());
        assert!(store.list_events(game.id).await.unwrap().is_empty());
        assert!(!store.delete_game(game.id).await.unwrap());
    }

    #[tokio::test]
    async fn schedule_event_requires_game_and_free_key() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let orphan = store.schedule_event(Uuid::new_v4(), reminder(5, now)).await;
        assert!(matches!(orphan, Err(StorageError::Conflict { .. })));

        let game = game(now);
        write(&store, game.clone(), vec![]).await;
        let join = NewScheduledEvent {
            kind: EventKind::JoinNotification {
                participant_id: "p-1".into(),
            },
            due_at: now,
        };
        let first = store.schedule_event(game.id, join.clone()).await.unwrap();
        assert!(first.is_some());
        let second = store.schedule_event(game.id, join.clone()).await.unwrap();
        assert!(second.is_none());
        assert!(store.cancel_event(game.id, join.kind.clone()).await.unwrap());
        assert!(!store.cancel_event(game.id, join.kind).await.unwrap());
    }

    #[tokio::test]
    async fn claim_only_returns_due_pending_rows() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let outcome = write(
            &store,
            game(now),
            vec![
                reminder(5, now - Duration::minutes(1)),
                reminder(1, now + Duration::hours(1)),
            ],
        )
        .await;
        let (due, future) = (&outcome.inserted[0], &outcome.inserted[1]);

        assert!(store.claim(future.id, now).await.unwrap().is_none());

        let claim = store.claim(due.id, now).await.unwrap().unwrap();
        assert_eq!(claim.event().id, due.id);
        assert_eq!(claim.game_status(), GameStatus::Scheduled);
        claim.commit(None).await.unwrap();

        assert!(store.claim(due.id, now).await.unwrap().is_none());
        assert!(store.due_events(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_rows_are_skipped_until_released() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let row = write(&store, game(now), vec![reminder(5, now - Duration::minutes(1))])
            .await
            .inserted
            .remove(0);

        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        assert!(store.claim(row.id, now).await.unwrap().is_none());

        claim.release().await.unwrap();
        let due = store.due_events(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(!due[0].applied);

        let dropped = store.claim(row.id, now).await.unwrap();
        assert!(dropped.is_some());
        drop(dropped);
        assert!(store.claim(row.id, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_applies_status_only_when_allowed() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        let mut game = game(now);
        let transition = NewScheduledEvent {
            kind: EventKind::StatusTransition {
                target: GameStatus::InProgress,
            },
            due_at: now - Duration::seconds(1),
        };
        let row = write(&store, game.clone(), vec![transition.clone()])
            .await
            .inserted
            .remove(0);

        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        claim.commit(Some(GameStatus::InProgress)).await.unwrap();
        let stored = store.find_game(game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::InProgress);

        game.id = Uuid::new_v4();
        game.status = GameStatus::Cancelled;
        let row = write(&store, game.clone(), vec![transition])
            .await
            .inserted
            .remove(0);
        let claim = store.claim(row.id, now).await.unwrap().unwrap();
        claim.commit(Some(GameStatus::InProgress)).await.unwrap();
        let stored = store.find_game(game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Cancelled);
    }

    #[tokio::test]
    async fn pending_counts_split_overdue_rows() {
        let store = MemoryScheduleStore::new();
        let now = OffsetDateTime::now_utc();
        write(
            &store,
            game(now),
            vec![
                reminder(5, now - Duration::minutes(1)),
                reminder(1, now + Duration::hours(1)),
            ],
        )
        .await;
        let counts = store.pending_counts(now).await.unwrap();
        assert_eq!(
            counts,
            PendingCounts {
                pending: 2,
                overdue: 1
            }
        );
    }
}
