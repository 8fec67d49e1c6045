use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dao::models::{EventKind, GameStatus, ScheduledEvent};

/// Delivery name for reminders.
pub const REMINDER_DUE: &str = "reminder.due";
/// Delivery name for applied status transitions.
pub const STATUS_CHANGED: &str = "game.status_changed";
/// Delivery name for join notifications.
pub const JOIN_NOTIFICATION_DUE: &str = "join_notification.due";

/// Message handed to the downstream bus for one due event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Delivery {
    /// Event name, derived from the kind.
    pub event: String,
    /// Identifier of the scheduled row; stable across retries.
    pub event_id: Uuid,
    /// Owning game.
    pub game_id: Uuid,
    /// Kind of the row that fired.
    pub kind: EventKind,
    /// When the row was due.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub due_at: OffsetDateTime,
    /// When this attempt was made.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub dispatched_at: OffsetDateTime,
    /// Status before a transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<GameStatus>,
    /// Status after a transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<GameStatus>,
}

impl Delivery {
    /// Build the message for a claimed row; `game_status` is the status read
    /// under the claim.
    pub fn for_event(
        event: &ScheduledEvent,
        game_status: GameStatus,
        dispatched_at: OffsetDateTime,
    ) -> Self {
        let (from, to) = match event.kind {
            EventKind::StatusTransition { target } => (Some(game_status), Some(target)),
            _ => (None, None),
        };

        Self {
            event: event_name(&event.kind).to_owned(),
            event_id: event.id,
            game_id: event.game_id,
            kind: event.kind.clone(),
            due_at: event.due_at,
            dispatched_at,
            from,
            to,
        }
    }
}

/// Event name carried by deliveries of `kind`.
pub fn event_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Reminder { .. } => REMINDER_DUE,
        EventKind::StatusTransition { .. } => STATUS_CHANGED,
        EventKind::JoinNotification { .. } => JOIN_NOTIFICATION_DUE,
    }
}
