//! DTO definitions used by the scheduling REST API.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{EventKind, GameEntity, GameStatus, ScheduledEvent},
    dto::validation::validate_reminder_offsets,
};

/// Scheduling fields of a game, pushed by the CRUD layer on create and update.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct ScheduleGameRequest {
    /// Start of the game.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub scheduled_at: OffsetDateTime,
    /// Expected play time; no automatic completion when absent.
    #[serde(default)]
    #[validate(range(min = 1, max = 1440))]
    pub expected_duration_minutes: Option<u32>,
    /// Reminder offsets, in minutes before the start.
    #[serde(default)]
    #[validate(
        length(max = 16),
        custom(function = "validate_reminder_offsets")
    )]
    pub reminder_minutes: Vec<u32>,
    /// Lifecycle status as known by the CRUD layer. Kept unchanged when omitted.
    #[serde(default)]
    pub status: Option<GameStatus>,
}

impl ScheduleGameRequest {
    /// Project the request onto the scheduler's game model.
    pub fn into_entity(
        self,
        game_id: Uuid,
        current: Option<GameStatus>,
        now: OffsetDateTime,
    ) -> GameEntity {
        GameEntity {
            id: game_id,
            scheduled_at: self.scheduled_at,
            expected_duration_minutes: self.expected_duration_minutes,
            reminder_minutes: self.reminder_minutes,
            status: self
                .status
                .or(current)
                .unwrap_or(GameStatus::Scheduled),
            updated_at: now,
        }
    }
}

/// Payload registering a participant join.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct JoinNotificationRequest {
    /// Caller-chosen participant identifier, unique per game.
    #[validate(length(min = 1, max = 64))]
    pub participant_id: String,
}

/// One scheduled row as exposed over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ScheduledEventView {
    /// Row identifier.
    pub id: Uuid,
    /// What fires.
    pub kind: EventKind,
    /// When it fires.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub due_at: OffsetDateTime,
    /// Already dispatched.
    pub applied: bool,
    /// When it was dispatched.
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub applied_at: Option<OffsetDateTime>,
}

impl From<ScheduledEvent> for ScheduledEventView {
    fn from(value: ScheduledEvent) -> Self {
        Self {
            id: value.id,
            kind: value.kind,
            due_at: value.due_at,
            applied: value.applied,
            applied_at: value.applied_at,
        }
    }
}

/// Result of a schedule recalculation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScheduleSummary {
    /// Game the schedule belongs to.
    pub game_id: Uuid,
    /// Status as written, an omitted one resolved against the stored game.
    pub status: GameStatus,
    /// Pending rows deleted by the recalculation.
    pub removed: u64,
    /// Rows inserted by the recalculation.
    pub inserted: usize,
    /// Inserted rows that were already due and fire on the next cycle.
    pub overdue: usize,
    /// Every row of the game after the write, pending and applied.
    pub events: Vec<ScheduledEventView>,
}

/// All rows of one game.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GameScheduleView {
    /// Game the rows belong to.
    pub game_id: Uuid,
    /// Current lifecycle status.
    pub status: GameStatus,
    /// Start of the game.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub scheduled_at: OffsetDateTime,
    /// Rows ordered by due time.
    pub events: Vec<ScheduledEventView>,
}
