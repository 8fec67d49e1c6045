use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a game session as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// Announced, not started yet.
    Scheduled,
    /// Started at `scheduled_at`.
    InProgress,
    /// Ended, either automatically after the expected duration or manually.
    Completed,
    /// Called off before completion.
    Cancelled,
}

impl GameStatus {
    /// Wire name stored in the database and used in payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Scheduled => "SCHEDULED",
            GameStatus::InProgress => "IN_PROGRESS",
            GameStatus::Completed => "COMPLETED",
            GameStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Scheduled -> Completed` is accepted so a daemon that was down through a
    /// whole game can still close it.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::Scheduled, GameStatus::InProgress)
                | (GameStatus::Scheduled, GameStatus::Completed)
                | (GameStatus::InProgress, GameStatus::Completed)
                | (GameStatus::Scheduled, GameStatus::Cancelled)
                | (GameStatus::InProgress, GameStatus::Cancelled)
        )
    }

    /// Statuses from which `self` can be reached.
    pub fn predecessors(self) -> Vec<GameStatus> {
        [
            GameStatus::Scheduled,
            GameStatus::InProgress,
            GameStatus::Completed,
            GameStatus::Cancelled,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(self))
        .collect()
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a persisted value does not decode into a known model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} `{value}`")]
pub struct UnknownValue {
    /// Which kind of value failed to decode.
    pub what: &'static str,
    /// The offending raw value.
    pub value: String,
}

impl FromStr for GameStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SCHEDULED" => Ok(GameStatus::Scheduled),
            "IN_PROGRESS" => Ok(GameStatus::InProgress),
            "COMPLETED" => Ok(GameStatus::Completed),
            "CANCELLED" => Ok(GameStatus::Cancelled),
            other => Err(UnknownValue {
                what: "game status",
                value: other.to_owned(),
            }),
        }
    }
}

pub(crate) const KIND_REMINDER: &str = "reminder";
pub(crate) const KIND_STATUS_TRANSITION: &str = "status_transition";
pub(crate) const KIND_JOIN_NOTIFICATION: &str = "join_notification";

/// Kind labels whose rows are owned by the recalculator.
pub(crate) const RECALCULATED_KINDS: [&str; 2] = [KIND_REMINDER, KIND_STATUS_TRANSITION];

/// What a scheduled event does once it becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Remind participants `offset_minutes` before the game starts.
    Reminder {
        /// Minutes before `scheduled_at`.
        offset_minutes: u32,
    },
    /// Move the game to `target`.
    StatusTransition {
        /// Status applied when the event fires.
        target: GameStatus,
    },
    /// Tell the host that a participant joined.
    JoinNotification {
        /// Identifier of the participant who joined.
        participant_id: String,
    },
}

impl EventKind {
    /// Stable label stored alongside the discriminant.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Reminder { .. } => KIND_REMINDER,
            EventKind::StatusTransition { .. } => KIND_STATUS_TRANSITION,
            EventKind::JoinNotification { .. } => KIND_JOIN_NOTIFICATION,
        }
    }

    /// Per-kind discriminant; `(game_id, label, discriminant)` is unique.
    pub fn discriminant(&self) -> String {
        match self {
            EventKind::Reminder { offset_minutes } => offset_minutes.to_string(),
            EventKind::StatusTransition { target } => target.as_str().to_owned(),
            EventKind::JoinNotification { participant_id } => participant_id.clone(),
        }
    }

    /// Rebuild a kind from its persisted `(label, discriminant)` pair.
    pub fn from_parts(label: &str, discriminant: &str) -> Result<Self, UnknownValue> {
        match label {
            KIND_REMINDER => discriminant
                .parse::<u32>()
                .map(|offset_minutes| EventKind::Reminder { offset_minutes })
                .map_err(|_| UnknownValue {
                    what: "reminder offset",
                    value: discriminant.to_owned(),
                }),
            KIND_STATUS_TRANSITION => discriminant
                .parse::<GameStatus>()
                .map(|target| EventKind::StatusTransition { target }),
            KIND_JOIN_NOTIFICATION => Ok(EventKind::JoinNotification {
                participant_id: discriminant.to_owned(),
            }),
            other => Err(UnknownValue {
                what: "event kind",
                value: other.to_owned(),
            }),
        }
    }

    /// Reminders and status transitions are derived from the game's
    /// configuration and replaced on every recalculation.
    pub fn is_recalculated(&self) -> bool {
        RECALCULATED_KINDS.contains(&self.label())
    }

    /// Key used to enforce the one-row-per-discriminant rule.
    pub fn unique_key(&self) -> (&'static str, String) {
        (self.label(), self.discriminant())
    }
}

/// Scheduling-relevant projection of a game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEntity {
    /// Primary key of the game.
    pub id: Uuid,
    /// Start of the game (UTC).
    pub scheduled_at: OffsetDateTime,
    /// Expected play time; no automatic completion without it.
    pub expected_duration_minutes: Option<u32>,
    /// Reminder offsets in minutes before the start.
    pub reminder_minutes: Vec<u32>,
    /// Current lifecycle status.
    pub status: GameStatus,
    /// Last time the scheduling fields were written.
    pub updated_at: OffsetDateTime,
}

impl GameEntity {
    /// Expected end of the game, when a duration is known.
    pub fn expected_end(&self) -> Option<OffsetDateTime> {
        self.expected_duration_minutes
            .and_then(|minutes| {
                self.scheduled_at
                    .checked_add(Duration::minutes(i64::from(minutes)))
            })
    }
}

/// How a schedule replace treats the status already stored for the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// Write the status carried by the new game.
    Overwrite,
    /// Keep the stored status; only a new game takes the carried one.
    KeepStored,
}

impl StatusWrite {
    /// Status to persist for `game`, given the one read under the write lock.
    pub fn resolve(self, game: &GameEntity, stored: Option<GameStatus>) -> GameStatus {
        match (self, stored) {
            (StatusWrite::KeepStored, Some(stored)) => stored,
            _ => game.status,
        }
    }
}

/// One pending or applied reminder / transition / notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Opaque identifier of the row.
    pub id: Uuid,
    /// Owning game.
    pub game_id: Uuid,
    /// What fires.
    pub kind: EventKind,
    /// When it fires (UTC).
    pub due_at: OffsetDateTime,
    /// Set once dispatched; never reset.
    pub applied: bool,
    /// When the row was marked applied.
    pub applied_at: Option<OffsetDateTime>,
    /// Insertion time.
    pub created_at: OffsetDateTime,
}

impl ScheduledEvent {
    /// Materialize a fresh pending row from a computed event.
    pub fn pending(game_id: Uuid, event: NewScheduledEvent, created_at: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            kind: event.kind,
            due_at: event.due_at,
            applied: false,
            applied_at: None,
            created_at,
        }
    }

    /// Pending and due at `now`.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        !self.applied && self.due_at <= now
    }

    /// Pending and due within `horizon` of `now` (already overdue included).
    pub fn is_near_term(&self, now: OffsetDateTime, horizon: std::time::Duration) -> bool {
        !self.applied && self.due_at <= now + horizon
    }
}

/// Output of the schedule computation, before it gets an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScheduledEvent {
    /// What fires.
    pub kind: EventKind,
    /// When it fires.
    pub due_at: OffsetDateTime,
}

/// Result of swapping a game's pending schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    /// The game as written, status included.
    pub game: GameEntity,
    /// Pending rows deleted.
    pub removed: u64,
    /// Rows inserted (rows blocked by an applied twin are not listed).
    pub inserted: Vec<ScheduledEvent>,
}

/// Counters over the pending part of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Rows with `applied = false`.
    pub pending: u64,
    /// Pending rows whose due time has passed.
    pub overdue: u64,
}

/// Row operation reported on the wake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WakeOperation {
    /// Row inserted.
    Insert,
    /// Row updated in place.
    Update,
    /// Row deleted.
    Delete,
}

/// Small payload sent on the wake channel. Only ever used as a hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeHint {
    /// Operation that touched the row.
    pub operation: WakeOperation,
    /// Owning game.
    pub game_id: Uuid,
    /// Due time of the affected row.
    #[serde(with = "time::serde::rfc3339")]
    pub due_at: OffsetDateTime,
}

impl WakeHint {
    /// Hint for a row that was just written by this process.
    pub fn inserted(event: &ScheduledEvent) -> Self {
        Self {
            operation: WakeOperation::Insert,
            game_id: event.game_id,
            due_at: event.due_at,
        }
    }

    /// Decode the JSON payload emitted by the database trigger.
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn status_lifecycle_is_enforced() {
        assert!(GameStatus::Scheduled.can_transition_to(GameStatus::InProgress));
        assert!(GameStatus::InProgress.can_transition_to(GameStatus::Completed));
        assert!(GameStatus::Scheduled.can_transition_to(GameStatus::Completed));
        assert!(!GameStatus::Completed.can_transition_to(GameStatus::InProgress));
        assert!(!GameStatus::Cancelled.can_transition_to(GameStatus::InProgress));
        assert!(!GameStatus::InProgress.can_transition_to(GameStatus::Scheduled));
        assert_eq!(
            GameStatus::Completed.predecessors(),
            vec![GameStatus::Scheduled, GameStatus::InProgress]
        );
    }

    #[test]
    fn status_round_trips_through_wire_name() {
        for status in [
            GameStatus::Scheduled,
            GameStatus::InProgress,
            GameStatus::Completed,
            GameStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<GameStatus>(), Ok(status));
        }
        assert!("PAUSED".parse::<GameStatus>().is_err());
    }

    fn game(scheduled_at: OffsetDateTime, duration: Option<u32>) -> GameEntity {
        GameEntity {
            id: Uuid::nil(),
            scheduled_at,
            expected_duration_minutes: duration,
            reminder_minutes: vec![],
            status: GameStatus::Scheduled,
            updated_at: scheduled_at,
        }
    }

    #[test]
    fn expected_end_is_none_past_the_calendar() {
        let late = game(datetime!(9999-12-31 23:00 UTC), Some(120));
        assert_eq!(late.expected_end(), None);

        let regular = game(datetime!(2026-10-19 20:00 UTC), Some(90));
        assert_eq!(regular.expected_end(), Some(datetime!(2026-10-19 21:30 UTC)));
    }

    #[test]
    fn keep_stored_status_only_applies_to_existing_games() {
        let incoming = game(datetime!(2026-10-19 20:00 UTC), None);
        assert_eq!(
            StatusWrite::KeepStored.resolve(&incoming, Some(GameStatus::InProgress)),
            GameStatus::InProgress
        );
        assert_eq!(
            StatusWrite::KeepStored.resolve(&incoming, None),
            GameStatus::Scheduled
        );
        assert_eq!(
            StatusWrite::Overwrite.resolve(&incoming, Some(GameStatus::InProgress)),
            GameStatus::Scheduled
        );
    }

    #[test]
    fn kinds_decode_from_persisted_parts() {
        let reminder = EventKind::Reminder { offset_minutes: 15 };
        assert_eq!(
            EventKind::from_parts(reminder.label(), &reminder.discriminant()),
            Ok(reminder)
        );
        assert_eq!(
            EventKind::from_parts("status_transition", "COMPLETED"),
            Ok(EventKind::StatusTransition {
                target: GameStatus::Completed
            })
        );
        assert!(EventKind::from_parts("reminder", "soon").is_err());
        assert!(EventKind::from_parts("digest", "1").is_err());
    }

    #[test]
    fn join_notifications_are_not_recalculated() {
        assert!(EventKind::Reminder { offset_minutes: 5 }.is_recalculated());
        assert!(
            EventKind::StatusTransition {
                target: GameStatus::InProgress
            }
            .is_recalculated()
        );
        assert!(
            !EventKind::JoinNotification {
                participant_id: "p-1".into()
            }
            .is_recalculated()
        );
    }

    #[test]
    fn wake_hint_decodes_trigger_payload() {
        let payload = r#"{"operation":"INSERT","game_id":"6f9619ff-8b86-d011-b42d-00cf4fc964ff","due_at":"2026-10-19T12:30:00.123456+00:00"}"#;
        let hint = WakeHint::from_payload(payload).unwrap();
        assert_eq!(hint.operation, WakeOperation::Insert);
        assert_eq!(hint.due_at, datetime!(2026-10-19 12:30:00.123456 UTC));
        assert!(WakeHint::from_payload("{}").is_err());
    }

    #[test]
    fn near_term_includes_overdue_rows_only_when_pending() {
        let now = datetime!(2026-10-19 12:00 UTC);
        let mut event = ScheduledEvent::pending(
            Uuid::new_v4(),
            NewScheduledEvent {
                kind: EventKind::Reminder { offset_minutes: 5 },
                due_at: now - Duration::minutes(1),
            },
            now,
        );
        let horizon = std::time::Duration::from_secs(600);
        assert!(event.is_near_term(now, horizon));
        assert!(event.is_due(now));

        event.due_at = now + Duration::minutes(30);
        assert!(!event.is_near_term(now, horizon));

        event.due_at = now;
        event.applied = true;
        assert!(!event.is_due(now));
        assert!(!event.is_near_term(now, horizon));
    }
}
