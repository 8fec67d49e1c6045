use std::{collections::HashSet, sync::Arc};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, ClientSession, Collection, Database,
    bson::doc,
    options::{IndexOptions, ReturnDocument},
};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{MongoEventDocument, MongoGameDocument, doc_id, to_bson},
};
use crate::dao::{
    models::{
        EventKind, GameEntity, GameStatus, NewScheduledEvent, PendingCounts, RECALCULATED_KINDS,
        ReplaceOutcome, ScheduledEvent, StatusWrite,
    },
    schedule_store::{EventClaim, ScheduleStore, SchedulePlanner, WakeStream},
    storage::StorageResult,
};

const GAME_COLLECTION_NAME: &str = "game_sessions";
const EVENT_COLLECTION_NAME: &str = "scheduled_events";

/// How long a claim keeps other workers away if its holder vanishes.
const CLAIM_LEASE: Duration = Duration::minutes(5);

/// MongoDB-backed [`ScheduleStore`] implementation.
///
/// Multi-document writes run in transactions, so the deployment must be a
/// replica set. There is no native wake channel; the daemon's timer covers it.
#[derive(Clone)]
pub struct MongoScheduleStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoScheduleStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let events = self.events().await;

        let unique_key = mongodb::IndexModel::builder()
            .keys(doc! {"game_id": 1, "kind": 1, "discriminant": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("scheduled_event_key_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();
        events
            .create_index(unique_key)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: EVENT_COLLECTION_NAME,
                index: "game_id,kind,discriminant",
                source,
            })?;

        let pending_due = mongodb::IndexModel::builder()
            .keys(doc! {"due_at": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("scheduled_event_pending_due_idx".to_owned()))
                    .partial_filter_expression(Some(doc! {"applied": false}))
                    .build(),
            )
            .build();
        events
            .create_index(pending_due)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: EVENT_COLLECTION_NAME,
                index: "due_at",
                source,
            })?;

        Ok(())
    }

    async fn client(&self) -> Client {
        let guard = self.inner.state.read().await;
        guard.client.clone()
    }

    async fn games(&self) -> Collection<MongoGameDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoGameDocument>(GAME_COLLECTION_NAME)
    }

    async fn events(&self) -> Collection<MongoEventDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoEventDocument>(EVENT_COLLECTION_NAME)
    }

    async fn start_transaction(&self, operation: &'static str) -> MongoResult<ClientSession> {
        let mut session = self
            .client()
            .await
            .start_session()
            .await
            .map_err(MongoDaoError::operation(operation))?;
        session
            .start_transaction()
            .await
            .map_err(MongoDaoError::operation(operation))?;
        Ok(session)
    }

    async fn replace(
        &self,
        mut game: GameEntity,
        status: StatusWrite,
        plan: SchedulePlanner,
    ) -> MongoResult<ReplaceOutcome> {
        let op = "replace_schedule";
        let game_id = game.id;
        let games = self.games().await;
        let event_coll = self.events().await;
        let mut session = self.start_transaction(op).await?;

        // A delivery committing a status after this read makes the write
        // below fail with a write conflict instead of overwriting it.
        let stored = games
            .find_one(doc_id(game_id))
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?
            .map(GameEntity::try_from)
            .transpose()?;
        game.status = status.resolve(&game, stored.map(|stored| stored.status));
        let events = plan(&game);

        games
            .replace_one(doc_id(game_id), MongoGameDocument::from(game.clone()))
            .upsert(true)
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?;

        let removed = event_coll
            .delete_many(doc! {
                "game_id": game_id.to_string(),
                "applied": false,
                "kind": {"$in": RECALCULATED_KINDS.to_vec()},
                "$or": [
                    {"claimed_until": null},
                    {"claimed_until": {"$lte": to_bson(OffsetDateTime::now_utc())}},
                ],
            })
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?
            .deleted_count;

        let mut cursor = event_coll
            .find(doc! {"game_id": game_id.to_string()})
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?;
        let survivors: Vec<MongoEventDocument> = cursor
            .stream(&mut session)
            .try_collect()
            .await
            .map_err(MongoDaoError::operation(op))?;
        let mut taken: HashSet<(String, String)> = survivors
            .iter()
            .map(|doc| (doc.kind.clone(), doc.discriminant.clone()))
            .collect();

        let now = OffsetDateTime::now_utc();
        let documents: Vec<MongoEventDocument> = events
            .iter()
            .map(|event| MongoEventDocument::pending(game_id, event, now))
            .filter(|doc| taken.insert((doc.kind.clone(), doc.discriminant.clone())))
            .collect();

        if !documents.is_empty() {
            event_coll
                .insert_many(documents.iter())
                .session(&mut session)
                .await
                .map_err(MongoDaoError::operation(op))?;
        }

        session
            .commit_transaction()
            .await
            .map_err(MongoDaoError::operation(op))?;

        let inserted = documents
            .into_iter()
            .map(ScheduledEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReplaceOutcome {
            game,
            removed,
            inserted,
        })
    }

    async fn delete_game(&self, game_id: Uuid) -> MongoResult<bool> {
        let op = "delete_game";
        let games = self.games().await;
        let events = self.events().await;
        let mut session = self.start_transaction(op).await?;

        let deleted = games
            .delete_one(doc_id(game_id))
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?
            .deleted_count;
        events
            .delete_many(doc! {"game_id": game_id.to_string()})
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?;

        session
            .commit_transaction()
            .await
            .map_err(MongoDaoError::operation(op))?;
        Ok(deleted > 0)
    }

    async fn find_game(&self, game_id: Uuid) -> MongoResult<Option<GameEntity>> {
        let document = self
            .games()
            .await
            .find_one(doc_id(game_id))
            .await
            .map_err(MongoDaoError::operation("find_game"))?;

        Ok(document.map(GameEntity::try_from).transpose()?)
    }

    async fn list_events(&self, game_id: Uuid) -> MongoResult<Vec<ScheduledEvent>> {
        let documents: Vec<MongoEventDocument> = self
            .events()
            .await
            .find(doc! {"game_id": game_id.to_string()})
            .sort(doc! {"due_at": 1, "created_at": 1})
            .await
            .map_err(MongoDaoError::operation("list_events"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::operation("list_events"))?;

        decode_events(documents)
    }

    async fn schedule_event(
        &self,
        game_id: Uuid,
        event: NewScheduledEvent,
    ) -> MongoResult<Option<ScheduledEvent>> {
        if self.find_game(game_id).await?.is_none() {
            return Err(MongoDaoError::MissingGame { id: game_id });
        }

        let document = MongoEventDocument::pending(game_id, &event, OffsetDateTime::now_utc());
        match self.events().await.insert_one(&document).await {
            Ok(_) => Ok(Some(ScheduledEvent::try_from(document)?)),
            Err(err) if is_duplicate_key(&err) => Ok(None),
            Err(source) => Err(MongoDaoError::Operation {
                operation: "schedule_event",
                source,
            }),
        }
    }

    async fn cancel_event(&self, game_id: Uuid, kind: EventKind) -> MongoResult<bool> {
        let result = self
            .events()
            .await
            .delete_one(doc! {
                "game_id": game_id.to_string(),
                "kind": kind.label(),
                "discriminant": kind.discriminant(),
                "applied": false,
            })
            .await
            .map_err(MongoDaoError::operation("cancel_event"))?;
        Ok(result.deleted_count > 0)
    }

    async fn due_events(&self, now: OffsetDateTime, limit: usize) -> MongoResult<Vec<ScheduledEvent>> {
        let documents: Vec<MongoEventDocument> = self
            .events()
            .await
            .find(doc! {"applied": false, "due_at": {"$lte": to_bson(now)}})
            .sort(doc! {"due_at": 1})
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(MongoDaoError::operation("due_events"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::operation("due_events"))?;

        decode_events(documents)
    }

    async fn claim(&self, event_id: Uuid, now: OffsetDateTime) -> MongoResult<Option<MongoClaim>> {
        let op = "claim";
        let leased = self
            .events()
            .await
            .find_one_and_update(
                doc! {
                    "_id": event_id.to_string(),
                    "applied": false,
                    "due_at": {"$lte": to_bson(now)},
                    "$or": [
                        {"claimed_until": null},
                        {"claimed_until": {"$lte": to_bson(now)}},
                    ],
                },
                doc! {"$set": {"claimed_until": to_bson(now + CLAIM_LEASE)}},
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(MongoDaoError::operation(op))?;

        let Some(document) = leased else {
            return Ok(None);
        };
        let event = ScheduledEvent::try_from(document)?;

        let Some(game) = self.find_game(event.game_id).await? else {
            self.release_claim(event.id).await?;
            return Ok(None);
        };

        Ok(Some(MongoClaim {
            store: self.clone(),
            event,
            game_status: game.status,
            settled: false,
        }))
    }

    async fn commit_claim(
        &self,
        event: &ScheduledEvent,
        apply_status: Option<GameStatus>,
    ) -> MongoResult<bool> {
        let op = "commit_claim";
        let games = self.games().await;
        let events = self.events().await;
        let mut session = self.start_transaction(op).await?;
        let now = to_bson(OffsetDateTime::now_utc());

        let marked = events
            .update_one(
                doc! {"_id": event.id.to_string(), "applied": false},
                doc! {
                    "$set": {"applied": true, "applied_at": now},
                    "$unset": {"claimed_until": ""},
                },
            )
            .session(&mut session)
            .await
            .map_err(MongoDaoError::operation(op))?
            .matched_count;

        if marked == 0 {
            session
                .abort_transaction()
                .await
                .map_err(MongoDaoError::operation(op))?;
            return Ok(false);
        }

        if let Some(target) = apply_status {
            let allowed_from: Vec<&str> = target
                .predecessors()
                .into_iter()
                .map(GameStatus::as_str)
                .collect();
            games
                .update_one(
                    doc! {"_id": event.game_id.to_string(), "status": {"$in": allowed_from}},
                    doc! {"$set": {"status": target.as_str(), "updated_at": now}},
                )
                .session(&mut session)
                .await
                .map_err(MongoDaoError::operation(op))?;
        }

        session
            .commit_transaction()
            .await
            .map_err(MongoDaoError::operation(op))?;
        Ok(true)
    }

    async fn release_claim(&self, event_id: Uuid) -> MongoResult<()> {
        self.events()
            .await
            .update_one(
                doc! {"_id": event_id.to_string(), "applied": false},
                doc! {"$unset": {"claimed_until": ""}},
            )
            .await
            .map_err(MongoDaoError::operation("release_claim"))?;
        Ok(())
    }

    async fn pending_counts(&self, now: OffsetDateTime) -> MongoResult<PendingCounts> {
        let events = self.events().await;
        let pending = events
            .count_documents(doc! {"applied": false})
            .await
            .map_err(MongoDaoError::operation("pending_counts"))?;
        let overdue = events
            .count_documents(doc! {"applied": false, "due_at": {"$lte": to_bson(now)}})
            .await
            .map_err(MongoDaoError::operation("pending_counts"))?;
        Ok(PendingCounts { pending, overdue })
    }
}

fn decode_events(documents: Vec<MongoEventDocument>) -> MongoResult<Vec<ScheduledEvent>> {
    documents
        .into_iter()
        .map(|doc| ScheduledEvent::try_from(doc).map_err(MongoDaoError::from))
        .collect()
}

/// Lease on one event document. An unsettled claim gives its lease back on drop.
struct MongoClaim {
    store: MongoScheduleStore,
    event: ScheduledEvent,
    game_status: GameStatus,
    settled: bool,
}

impl EventClaim for MongoClaim {
    fn event(&self) -> &ScheduledEvent {
        &self.event
    }

    fn game_status(&self) -> GameStatus {
        self.game_status
    }

    fn commit(
        mut self: Box<Self>,
        apply_status: Option<GameStatus>,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.settled = true;
        let store = self.store.clone();
        let event = self.event.clone();
        Box::pin(async move {
            store
                .commit_claim(&event, apply_status)
                .await
                .map_err(Into::into)
        })
    }

    fn release(mut self: Box<Self>) -> BoxFuture<'static, StorageResult<()>> {
        self.settled = true;
        let store = self.store.clone();
        let event_id = self.event.id;
        Box::pin(async move { store.release_claim(event_id).await.map_err(Into::into) })
    }
}

impl Drop for MongoClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let event_id = self.event.id;
        handle.spawn(async move {
            if let Err(err) = store.release_claim(event_id).await {
                warn!(%event_id, error = %err, "failed to release dropped claim; lease will expire");
            }
        });
    }
}

impl ScheduleStore for MongoScheduleStore {
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

    fn listen(&self, _channel: String) -> BoxFuture<'static, StorageResult<Option<WakeStream>>> {
        Box::pin(async { Ok(None) })
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
