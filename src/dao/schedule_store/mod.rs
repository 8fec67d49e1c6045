/// In-process store.
pub mod memory;
/// MongoDB store.
#[cfg(feature = "mongo-store")]
pub mod mongodb;
/// PostgreSQL store with a native wake channel.
#[cfg(feature = "postgres-store")]
pub mod postgres;
#[cfg(any(feature = "postgres-store", feature = "mongo-store"))]
mod retry;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dao::{
    models::{
        EventKind, GameEntity, GameStatus, NewScheduledEvent, PendingCounts, ReplaceOutcome,
        ScheduledEvent, StatusWrite, WakeHint,
    },
    storage::StorageResult,
};

pub use memory::MemoryScheduleStore;

/// Push stream of wake hints coming straight from the database.
///
/// An `Err` item means the subscription is gone; the consumer resubscribes.
pub type WakeStream = BoxStream<'static, StorageResult<WakeHint>>;

/// Computes the rows of a replace from the game as it will be written,
/// status resolved under the store's write lock.
pub type SchedulePlanner = Box<dyn FnOnce(&GameEntity) -> Vec<NewScheduledEvent> + Send>;

/// Planner that ignores the game and writes `events` as given.
pub fn fixed_plan(events: Vec<NewScheduledEvent>) -> SchedulePlanner {
    Box::new(move |_| events)
}

/// Abstraction over the persistence layer for scheduled events.
pub trait ScheduleStore: Send + Sync {
    /// Persist the game's scheduling fields and swap its pending reminder and
    /// status rows for the ones `plan` returns, atomically.
    ///
    /// The stored game is locked before `status` is resolved and `plan` runs,
    /// so a status committed by a concurrent delivery is never overwritten
    /// under [`StatusWrite::KeepStored`]. Rows currently claimed for delivery
    /// survive the swap and keep their key taken.
    fn replace_schedule(
        &self,
        game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> BoxFuture<'static, StorageResult<ReplaceOutcome>>;
    /// Delete the game and, by cascade, every event attached to it.
    fn delete_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;
    /// The stored scheduling fields of a game.
    fn find_game(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Option<GameEntity>>>;
    /// All rows of a game, pending and applied, ordered by due time.
    fn list_events(&self, game_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>>;
    /// Insert a single event unless its key is already taken.
    fn schedule_event(
        &self,
        game_id: Uuid,
        event: NewScheduledEvent,
    ) -> BoxFuture<'static, StorageResult<Option<ScheduledEvent>>>;
    /// Delete the pending row matching `kind`, if any.
    fn cancel_event(&self, game_id: Uuid, kind: EventKind)
    -> BoxFuture<'static, StorageResult<bool>>;
    /// Pending rows due at `now`, oldest first, at most `limit`.
    fn due_events(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScheduledEvent>>>;
    /// Lock a due, pending row for delivery. `None` when another worker holds
    /// it, it was applied or deleted meanwhile, or it is not due at `now`.
    fn claim(
        &self,
        event_id: Uuid,
        now: OffsetDateTime,
    ) -> BoxFuture<'static, StorageResult<Option<Box<dyn EventClaim>>>>;
    /// Pending rows in total and overdue at `now`.
    fn pending_counts(&self, now: OffsetDateTime) -> BoxFuture<'static, StorageResult<PendingCounts>>;
    /// Subscribe to the backend's native wake channel, when it has one.
    fn listen(&self, channel: String) -> BoxFuture<'static, StorageResult<Option<WakeStream>>>;
    /// Cheap round trip to the backend.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Rebuild the connection in place after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// An open delivery transaction on one scheduled event.
///
/// Dropping a claim without committing rolls it back.
pub trait EventClaim: Send {
    /// The row as re-read under the lock.
    fn event(&self) -> &ScheduledEvent;
    /// Status of the owning game when the claim was taken.
    fn game_status(&self) -> GameStatus;
    /// Mark the row applied, move the game to `apply_status` when its current
    /// status allows it, and commit.
    ///
    /// Returns `false` and changes nothing when the row no longer exists, which
    /// happens when its game was deleted while the claim was open.
    fn commit(
        self: Box<Self>,
        apply_status: Option<GameStatus>,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Roll back; the row stays pending.
    fn release(self: Box<Self>) -> BoxFuture<'static, StorageResult<()>>;
}
