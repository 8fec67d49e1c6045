use std::time::SystemTime;

use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dao::models::{
    EventKind, GameEntity, GameStatus, NewScheduledEvent, ScheduledEvent, UnknownValue,
};

/// Stored form of a game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoGameDocument {
    #[serde(rename = "_id")]
    pub(crate) id: String,
    pub(crate) scheduled_at: DateTime,
    pub(crate) expected_duration_minutes: Option<i64>,
    pub(crate) reminder_minutes: Vec<i64>,
    pub(crate) status: String,
    pub(crate) updated_at: DateTime,
}

impl From<GameEntity> for MongoGameDocument {
    fn from(value: GameEntity) -> Self {
        Self {
            id: value.id.to_string(),
            scheduled_at: to_bson(value.scheduled_at),
            expected_duration_minutes: value.expected_duration_minutes.map(i64::from),
            reminder_minutes: value.reminder_minutes.into_iter().map(i64::from).collect(),
            status: value.status.as_str().to_owned(),
            updated_at: to_bson(value.updated_at),
        }
    }
}

impl TryFrom<MongoGameDocument> for GameEntity {
    type Error = UnknownValue;

    fn try_from(value: MongoGameDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&value.id)?,
            scheduled_at: from_bson(value.scheduled_at),
            expected_duration_minutes: value
                .expected_duration_minutes
                .and_then(|minutes| u32::try_from(minutes).ok()),
            reminder_minutes: value
                .reminder_minutes
                .into_iter()
                .filter_map(|minutes| u32::try_from(minutes).ok())
                .collect(),
            status: value.status.parse::<GameStatus>()?,
            updated_at: from_bson(value.updated_at),
        })
    }
}

/// Stored form of a scheduled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoEventDocument {
    #[serde(rename = "_id")]
    pub(crate) id: String,
    pub(crate) game_id: String,
    pub(crate) kind: String,
    pub(crate) discriminant: String,
    pub(crate) due_at: DateTime,
    pub(crate) applied: bool,
    pub(crate) applied_at: Option<DateTime>,
    pub(crate) created_at: DateTime,
    /// Lease taken by a delivering worker; stands in for a row lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime>,
}

impl MongoEventDocument {
    /// Fresh pending document for a computed event.
    pub fn pending(game_id: Uuid, event: &NewScheduledEvent, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            kind: event.kind.label().to_owned(),
            discriminant: event.kind.discriminant(),
            due_at: to_bson(event.due_at),
            applied: false,
            applied_at: None,
            created_at: to_bson(now),
            claimed_until: None,
        }
    }
}

impl TryFrom<MongoEventDocument> for ScheduledEvent {
    type Error = UnknownValue;

    fn try_from(value: MongoEventDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&value.id)?,
            game_id: parse_id(&value.game_id)?,
            kind: EventKind::from_parts(&value.kind, &value.discriminant)?,
            due_at: from_bson(value.due_at),
            applied: value.applied,
            applied_at: value.applied_at.map(from_bson),
            created_at: from_bson(value.created_at),
        })
    }
}

/// Filter on `_id`.
pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

/// BSON datetime, millisecond precision.
pub fn to_bson(value: OffsetDateTime) -> DateTime {
    DateTime::from_system_time(SystemTime::from(value))
}

/// Back to `OffsetDateTime`.
pub fn from_bson(value: DateTime) -> OffsetDateTime {
    OffsetDateTime::from(value.to_system_time())
}

fn parse_id(raw: &str) -> Result<Uuid, UnknownValue> {
    Uuid::parse_str(raw).map_err(|_| UnknownValue {
        what: "document id",
        value: raw.to_owned(),
    })
}
