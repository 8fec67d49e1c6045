use indexmap::IndexSet;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::{
    dao::{
        models::{EventKind, GameEntity, GameStatus, NewScheduledEvent, ReplaceOutcome, StatusWrite},
        schedule_store::ScheduleStore,
    },
    error::ServiceError,
};

/// One week.
pub const MAX_REMINDER_OFFSET_MINUTES: u32 = 10_080;
/// Distinct offsets accepted per game.
pub const MAX_REMINDERS: usize = 16;
/// One day.
pub const MAX_DURATION_MINUTES: u32 = 1_440;
/// Upper bound, in characters, on a join notification's participant id.
pub const MAX_PARTICIPANT_ID_LEN: usize = 64;

/// Configuration rejected before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("reminder offset {0} must be between 1 and {MAX_REMINDER_OFFSET_MINUTES} minutes")]
    ReminderOffsetOutOfRange(u32),
    #[error("at most {MAX_REMINDERS} reminder offsets are allowed, got {0}")]
    TooManyReminders(usize),
    #[error("expected duration {0} must be between 1 and {MAX_DURATION_MINUTES} minutes")]
    DurationOutOfRange(u32),
    #[error("participant id must be between 1 and {MAX_PARTICIPANT_ID_LEN} characters")]
    InvalidParticipant,
    #[error("scheduled time {0} leaves no room for its reminders or expected duration")]
    ScheduledAtOutOfRange(OffsetDateTime),
}

/// Events a game's configuration implies, plus how many are already due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedSchedule {
    /// Rows to write, reminders first.
    pub events: Vec<NewScheduledEvent>,
    /// Rows already due at computation time.
    pub overdue: usize,
}

/// Outcome of a recalculation that reached the store.
#[derive(Debug, Clone)]
pub struct Recalculation {
    /// What the store changed.
    pub outcome: ReplaceOutcome,
    /// Rows already due when the schedule was written.
    pub overdue: usize,
}

/// Check the scheduling fields of a game.
pub fn validate_game(game: &GameEntity) -> Result<(), ScheduleError> {
    if game.reminder_minutes.len() > MAX_REMINDERS {
        return Err(ScheduleError::TooManyReminders(game.reminder_minutes.len()));
    }

    if let Some(offset) = game
        .reminder_minutes
        .iter()
        .copied()
        .find(|offset| *offset == 0 || *offset > MAX_REMINDER_OFFSET_MINUTES)
    {
        return Err(ScheduleError::ReminderOffsetOutOfRange(offset));
    }

    if let Some(minutes) = game.expected_duration_minutes
        && (minutes == 0 || minutes > MAX_DURATION_MINUTES)
    {
        return Err(ScheduleError::DurationOutOfRange(minutes));
    }

    let reminders_fit = game
        .reminder_minutes
        .iter()
        .all(|offset| reminder_due(game.scheduled_at, *offset).is_some());
    let end_fits = game.expected_duration_minutes.is_none() || game.expected_end().is_some();
    if !reminders_fit || !end_fits {
        return Err(ScheduleError::ScheduledAtOutOfRange(game.scheduled_at));
    }

    Ok(())
}

fn reminder_due(scheduled_at: OffsetDateTime, offset_minutes: u32) -> Option<OffsetDateTime> {
    scheduled_at.checked_sub(Duration::minutes(i64::from(offset_minutes)))
}

/// Check a join notification's participant id.
pub fn validate_participant(participant_id: &str) -> Result<(), ScheduleError> {
    let length = participant_id.chars().count();
    if participant_id.trim().is_empty() || length > MAX_PARTICIPANT_ID_LEN {
        return Err(ScheduleError::InvalidParticipant);
    }
    Ok(())
}

/// Compute the reminder and status rows implied by `game`.
///
/// Offsets that already elapsed are kept: the next due-query fires them.
/// Terminal games produce nothing, and neither do times past the calendar,
/// which [`validate_game`] rejects up front.
pub fn compute_schedule(game: &GameEntity, now: OffsetDateTime) -> ComputedSchedule {
    let mut events = Vec::new();

    if game.status == GameStatus::Scheduled {
        let offsets = game.reminder_minutes.iter().copied().collect::<IndexSet<_>>();
        events.extend(offsets.into_iter().filter_map(|offset_minutes| {
            Some(NewScheduledEvent {
                kind: EventKind::Reminder { offset_minutes },
                due_at: reminder_due(game.scheduled_at, offset_minutes)?,
            })
        }));

        events.push(NewScheduledEvent {
            kind: EventKind::StatusTransition {
                target: GameStatus::InProgress,
            },
            due_at: game.scheduled_at,
        });
    }

    if matches!(game.status, GameStatus::Scheduled | GameStatus::InProgress)
        && let Some(end) = game.expected_end()
    {
        events.push(NewScheduledEvent {
            kind: EventKind::StatusTransition {
                target: GameStatus::Completed,
            },
            due_at: end,
        });
    }

    let overdue = events.iter().filter(|event| event.due_at <= now).count();
    ComputedSchedule { events, overdue }
}

/// Validate, compute and atomically swap the pending schedule of `game`.
///
/// The schedule is computed inside the store's replace, from the status the
/// store resolves under its write lock.
pub async fn recalculate(
    store: &dyn ScheduleStore,
    game: GameEntity,
    status: StatusWrite,
    now: OffsetDateTime,
) -> Result<Recalculation, ServiceError> {
    validate_game(&game)?;

    let game_id = game.id;
    let plan = Box::new(move |stored: &GameEntity| {
        let events = compute_schedule(stored, now).events;
        debug!(%game_id, status = %stored.status, computed = events.len(), "recomputed schedule");
        events
    });

    let outcome = store.replace_schedule(game, status, plan).await?;
    let overdue = compute_schedule(&outcome.game, now).overdue;
    info!(
        %game_id,
        status = %outcome.game.status,
        removed = outcome.removed,
        inserted = outcome.inserted.len(),
        overdue,
        "schedule replaced"
    );

    Ok(Recalculation { outcome, overdue })
}
