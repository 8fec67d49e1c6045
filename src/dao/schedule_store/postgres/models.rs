use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dao::models::{EventKind, GameEntity, GameStatus, ScheduledEvent, UnknownValue};

/// Column list selected for a `scheduled_events` row.
pub const EVENT_COLUMNS: &str =
    "id, game_id, kind, discriminant, due_at, applied, applied_at, created_at";

/// Raw `scheduled_events` row.
#[derive(Debug, FromRow)]
pub struct EventRow {
    id: Uuid,
    game_id: Uuid,
    kind: String,
    discriminant: String,
    due_at: OffsetDateTime,
    applied: bool,
    applied_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for ScheduledEvent {
    type Error = UnknownValue;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            game_id: row.game_id,
            kind: EventKind::from_parts(&row.kind, &row.discriminant)?,
            due_at: row.due_at,
            applied: row.applied,
            applied_at: row.applied_at,
            created_at: row.created_at,
        })
    }
}

/// Event row locked together with the owning game's status.
#[derive(Debug, FromRow)]
pub struct ClaimedRow {
    /// The locked row.
    #[sqlx(flatten)]
    pub event: EventRow,
    /// Status of its game at claim time.
    pub game_status: String,
}

/// Raw `game_sessions` row.
#[derive(Debug, FromRow)]
pub struct GameRow {
    id: Uuid,
    scheduled_at: OffsetDateTime,
    expected_duration_minutes: Option<i32>,
    reminder_minutes: Vec<i32>,
    status: String,
    updated_at: OffsetDateTime,
}

impl TryFrom<GameRow> for GameEntity {
    type Error = UnknownValue;

    fn try_from(row: GameRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scheduled_at: row.scheduled_at,
            expected_duration_minutes: row
                .expected_duration_minutes
                .and_then(|minutes| u32::try_from(minutes).ok()),
            reminder_minutes: row
                .reminder_minutes
                .into_iter()
                .filter_map(|minutes| u32::try_from(minutes).ok())
                .collect(),
            status: row.status.parse::<GameStatus>()?,
            updated_at: row.updated_at,
        })
    }
}

/// Column values are validated well below `i32::MAX`; saturate anyway.
pub fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn game_row_decodes_and_rejects_unknown_status() {
        let row = |status: &str| GameRow {
            id: Uuid::new_v4(),
            scheduled_at: datetime!(2026-10-19 20:00 UTC),
            expected_duration_minutes: Some(120),
            reminder_minutes: vec![60, 15],
            status: status.into(),
            updated_at: datetime!(2026-10-19 10:00 UTC),
        };
        let game = GameEntity::try_from(row("IN_PROGRESS")).unwrap();
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.reminder_minutes, vec![60, 15]);
        assert_eq!(game.expected_duration_minutes, Some(120));

        assert!(GameEntity::try_from(row("PAUSED")).is_err());
    }

    #[test]
    fn event_row_decodes_kind_from_parts() {
        let row = EventRow {
            id: Uuid::new_v4(),
            game_id: Uuid::new_v4(),
            kind: "status_transition".into(),
            discriminant: "COMPLETED".into(),
            due_at: datetime!(2026-10-19 22:00 UTC),
            applied: false,
            applied_at: None,
            created_at: datetime!(2026-10-19 10:00 UTC),
        };
        let event = ScheduledEvent::try_from(row).unwrap();
        assert_eq!(
            event.kind,
            EventKind::StatusTransition {
                target: GameStatus::Completed
            }
        );
        assert_eq!(to_db_int(u32::MAX), i32::MAX);
    }
}
