//! Polling daemon: waits on the wake hub, the poll timer or shutdown, then
//! runs the due-query and delivers each due row inside its own claim.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream};
use time::OffsetDateTime;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError, error::TryRecvError},
        watch,
    },
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};

use crate::{
    dao::{
        models::{EventKind, ScheduledEvent},
        schedule_store::ScheduleStore,
    },
    dto::delivery::Delivery,
    services::dispatcher::Dispatcher,
    state::{
        DaemonEvent, DaemonPhase, DaemonStateMachine, DaemonTelemetry, DeliveryOutcome,
        SharedState, WakeSignal, WakeSource,
    },
};

/// Tally of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows returned by the due-query.
    pub due: usize,
    /// Delivered and committed.
    pub dispatched: usize,
    /// Dispatch or commit failed; retried next cycle.
    pub failed: usize,
    /// Stale status transitions committed without dispatch.
    pub skipped: usize,
    /// Claimed elsewhere, applied or deleted between the query and the claim.
    pub raced: usize,
}

impl CycleReport {
    /// A full batch that made progress means more rows may be waiting.
    pub fn has_backlog(&self, batch_size: usize) -> bool {
        self.due >= batch_size && self.dispatched + self.skipped > 0
    }

    fn add(mut self, outcome: RowOutcome) -> Self {
        match outcome {
            RowOutcome::Dispatched => self.dispatched += 1,
            RowOutcome::Failed => self.failed += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Raced => self.raced += 1,
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Dispatched,
    Failed,
    Skipped,
    Raced,
}

/// Runs cycles; cheap to clone into the per-row delivery futures.
#[derive(Clone)]
struct CycleRunner {
    state: SharedState,
    dispatcher: Arc<dyn Dispatcher>,
}

impl CycleRunner {
    async fn run_cycle(&self, now: OffsetDateTime) -> CycleReport {
        let store = match self.state.require_schedule_store().await {
            Ok(store) => store,
            Err(_) => {
                debug!("storage degraded; skipping cycle");
                return CycleReport::default();
            }
        };

        let config = self.state.config();
        let due = match store.due_events(now, config.batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "due-query failed; retrying next cycle");
                return CycleReport::default();
            }
        };

        let report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            return report;
        }

        let runner = self.clone();
        stream::iter(due)
            .map(move |event| {
                let runner = runner.clone();
                let store = store.clone();
                async move { runner.deliver(store, event, now).await }
            })
            .buffer_unordered(config.dispatch_concurrency)
            .fold(report, |report, outcome| async move { report.add(outcome) })
            .await
    }

    /// Claim, dispatch, then commit or release one row.
    async fn deliver(
        &self,
        store: Arc<dyn ScheduleStore>,
        candidate: ScheduledEvent,
        now: OffsetDateTime,
    ) -> RowOutcome {
        let telemetry = self.state.telemetry();
        let label = candidate.kind.label();

        let claim = match store.claim(candidate.id, now).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                debug!(event_id = %candidate.id, "row taken, applied or removed since the due-query");
                return RowOutcome::Raced;
            }
            Err(err) => {
                warn!(event_id = %candidate.id, error = %err, "failed to claim due row");
                telemetry.record(label, DeliveryOutcome::Failed);
                return RowOutcome::Failed;
            }
        };

        let event = claim.event().clone();
        let game_status = claim.game_status();

        let apply_status = match event.kind {
            EventKind::StatusTransition { target } if !game_status.can_transition_to(target) => {
                info!(
                    event_id = %event.id,
                    game_id = %event.game_id,
                    from = %game_status,
                    to = %target,
                    "stale status transition; marking applied without dispatch"
                );
                return match claim.commit(None).await {
                    Ok(_) => {
                        telemetry.record(label, DeliveryOutcome::Skipped);
                        RowOutcome::Skipped
                    }
                    Err(err) => {
                        warn!(event_id = %event.id, error = %err, "failed to retire stale transition");
                        telemetry.record(label, DeliveryOutcome::Failed);
                        RowOutcome::Failed
                    }
                };
            }
            EventKind::StatusTransition { target } => Some(target),
            _ => None,
        };

        let delivery = Delivery::for_event(&event, game_status, now);
        if let Err(err) = self.dispatcher.dispatch(delivery).await {
            warn!(
                event_id = %event.id,
                game_id = %event.game_id,
                kind = label,
                error = %err,
                "dispatch failed; row stays pending"
            );
            if let Err(release_err) = claim.release().await {
                warn!(event_id = %event.id, error = %release_err, "failed to release claim");
            }
            telemetry.record(label, DeliveryOutcome::Failed);
            return RowOutcome::Failed;
        }

        match claim.commit(apply_status).await {
            Ok(false) => {
                warn!(
                    event_id = %event.id,
                    game_id = %event.game_id,
                    kind = label,
                    "delivered row was deleted with its game before it could be marked applied"
                );
                telemetry.record(label, DeliveryOutcome::Dispatched);
                RowOutcome::Dispatched
            }
            Ok(true) => {
                info!(
                    event_id = %event.id,
                    game_id = %event.game_id,
                    kind = label,
                    due_at = %event.due_at,
                    "scheduled event delivered"
                );
                telemetry.record(label, DeliveryOutcome::Dispatched);
                RowOutcome::Dispatched
            }
            Err(err) => {
                error!(
                    event_id = %event.id,
                    game_id = %event.game_id,
                    error = %err,
                    "delivered but failed to mark applied; it will be delivered again"
                );
                telemetry.record(label, DeliveryOutcome::Failed);
                RowOutcome::Failed
            }
        }
    }
}

/// Long-running delivery loop.
pub struct PollingDaemon {
    runner: CycleRunner,
    machine: DaemonStateMachine,
    /// Earliest future due time announced by a hint.
    next_hinted: Option<OffsetDateTime>,
}

impl PollingDaemon {
    /// Daemon delivering through `dispatcher`.
    pub fn new(state: SharedState, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            runner: CycleRunner { state, dispatcher },
            machine: DaemonStateMachine::new(),
            next_hinted: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> DaemonPhase {
        self.machine.phase()
    }

    /// One due-query and delivery batch evaluated at `now`, outside the loop.
    pub async fn run_cycle(&self, now: OffsetDateTime) -> CycleReport {
        self.runner.run_cycle(now).await
    }

    /// Run until `shutdown` turns true (or its sender goes away), then let
    /// the in-flight batch finish. Returns the final phase.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DaemonPhase {
        let state = self.runner.state.clone();
        let config = state.config();
        let mut wake = state.wake_hub().subscribe();
        state.telemetry().set_phase(self.machine.phase()).await;
        info!(
            poll_interval_secs = config.poll_interval.as_secs(),
            batch_size = config.batch_size,
            dispatch_concurrency = config.dispatch_concurrency,
            "polling daemon started"
        );

        let mut source = WakeSource::Startup;
        loop {
            let (report, interrupted) = self.poll(source, &mut shutdown).await;
            if interrupted || stop_requested(&shutdown) {
                break;
            }

            if report.has_backlog(config.batch_size) {
                debug!(due = report.due, "full batch delivered; polling again");
                source = WakeSource::Timer;
                continue;
            }

            match self.wait(&mut wake, &mut shutdown).await {
                Some(next) => source = next,
                None => break,
            }
        }

        if self.machine.phase() == DaemonPhase::Idle {
            transition(&mut self.machine, state.telemetry(), DaemonEvent::Shutdown).await;
        }
        transition(&mut self.machine, state.telemetry(), DaemonEvent::Drained).await;
        info!(cycles = self.machine.cycles(), "polling daemon stopped");
        self.machine.phase()
    }

    async fn poll(
        &mut self,
        source: WakeSource,
        shutdown: &mut watch::Receiver<bool>,
    ) -> (CycleReport, bool) {
        let telemetry = self.runner.state.telemetry();
        transition(&mut self.machine, telemetry, DaemonEvent::Wake(source)).await;

        let started = OffsetDateTime::now_utc();
        telemetry
            .cycle_started(started, self.machine.cycles(), source)
            .await;
        self.next_hinted = self.next_hinted.filter(|at| *at > started);

        let cycle = self.runner.run_cycle(started);
        tokio::pin!(cycle);
        let (report, interrupted) = tokio::select! {
            biased;
            report = &mut cycle => (report, false),
            _ = shutdown_requested(shutdown) => {
                info!("shutdown requested; draining in-flight deliveries");
                transition(&mut self.machine, telemetry, DaemonEvent::Shutdown).await;
                (cycle.await, true)
            }
        };

        telemetry
            .cycle_finished(OffsetDateTime::now_utc(), report.due)
            .await;
        transition(&mut self.machine, telemetry, DaemonEvent::PollFinished).await;

        if report.due > 0 {
            info!(
                ?source,
                due = report.due,
                dispatched = report.dispatched,
                failed = report.failed,
                skipped = report.skipped,
                raced = report.raced,
                "poll cycle finished"
            );
        } else {
            debug!(?source, "poll cycle found nothing due");
        }

        (report, interrupted)
    }

    /// Block until the next wake source; `None` on shutdown.
    async fn wait(
        &mut self,
        wake: &mut broadcast::Receiver<WakeSignal>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<WakeSource> {
        let poll_interval = self.runner.state.config().poll_interval;
        let timer = sleep(self.sleep_for(poll_interval, OffsetDateTime::now_utc()));
        tokio::pin!(timer);
        let mut hub_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return None,
                signal = wake.recv(), if hub_open => match signal {
                    Ok(WakeSignal::Hint(hint)) => {
                        let now = OffsetDateTime::now_utc();
                        if hint.due_at <= now {
                            debug!(game_id = %hint.game_id, operation = ?hint.operation, "woken by due hint");
                            drain(wake);
                            return Some(WakeSource::Hint);
                        }
                        self.next_hinted = Some(self.next_hinted.map_or(hint.due_at, |at| at.min(hint.due_at)));
                        let deadline = Instant::now() + self.sleep_for(poll_interval, now);
                        if deadline < timer.deadline() {
                            timer.as_mut().reset(deadline);
                        }
                    }
                    Ok(WakeSignal::Resubscribed) => {
                        debug!("wake subscription re-established; polling for missed hints");
                        drain(wake);
                        return Some(WakeSource::Hint);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "wake hints lagged; polling");
                        drain(wake);
                        return Some(WakeSource::Hint);
                    }
                    Err(RecvError::Closed) => {
                        warn!("wake hub closed; relying on the poll timer");
                        hub_open = false;
                    }
                },
                _ = &mut timer => return Some(WakeSource::Timer),
            }
        }
    }

    /// Time until the earliest hinted row, capped by the poll interval.
    fn sleep_for(&self, poll_interval: Duration, now: OffsetDateTime) -> Duration {
        self.next_hinted
            .and_then(|at| Duration::try_from(at - now).ok())
            .map_or(poll_interval, |until| until.min(poll_interval))
    }
}

async fn transition(
    machine: &mut DaemonStateMachine,
    telemetry: &DaemonTelemetry,
    event: DaemonEvent,
) {
    match machine.apply(event) {
        Ok(phase) => telemetry.set_phase(phase).await,
        Err(err) => warn!(error = %err, "ignoring daemon phase change"),
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    shutdown.has_changed().is_err() || *shutdown.borrow()
}

/// Coalesce queued hints: one cycle covers them all.
fn drain(wake: &mut broadcast::Receiver<WakeSignal>) {
    loop {
        match wake.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::{self, BoxFuture};
    use time::Duration as TimeDuration;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{GameEntity, GameStatus, NewScheduledEvent, StatusWrite},
            schedule_store::{MemoryScheduleStore, fixed_plan},
        },
        services::dispatcher::DispatchError,
        state::AppState,
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Delivery>>,
        fail: Mutex<bool>,
    }

    struct RecordingDispatcher(Arc<Recorder>);

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), DispatchError>> {
            let result = if *self.0.fail.lock().unwrap() {
                Err(DispatchError::NoSubscribers)
            } else {
                self.0.sent.lock().unwrap().push(delivery);
                Ok(())
            };
            Box::pin(future::ready(result))
        }
    }

    async fn setup(config: AppConfig) -> (SharedState, MemoryScheduleStore, Arc<Recorder>, PollingDaemon) {
        let state = AppState::new(config);
        let store = MemoryScheduleStore::new();
        state.install_schedule_store(Arc::new(store.clone())).await;
        let recorder = Arc::new(Recorder::default());
        let daemon = PollingDaemon::new(
            state.clone(),
            Arc::new(RecordingDispatcher(recorder.clone())),
        );
        (state, store, recorder, daemon)
    }

    async fn seed(store: &MemoryScheduleStore, status: GameStatus, events: Vec<NewScheduledEvent>) -> Uuid {
        let game = GameEntity {
            id: Uuid::new_v4(),
            scheduled_at: OffsetDateTime::now_utc(),
            expected_duration_minutes: Some(60),
            reminder_minutes: vec![],
            status,
            updated_at: OffsetDateTime::now_utc(),
        };
        let id = game.id;
        store
            .replace_schedule(game, StatusWrite::Overwrite, fixed_plan(events))
            .await
            .unwrap();
        id
    }

    fn due_in(kind: EventKind, minutes: i64) -> NewScheduledEvent {
        NewScheduledEvent {
            kind,
            due_at: OffsetDateTime::now_utc() + TimeDuration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn cycle_delivers_due_rows_once() {
        let (_state, store, recorder, daemon) = setup(AppConfig::default()).await;
        seed(
            &store,
            GameStatus::Scheduled,
            vec![
                due_in(EventKind::Reminder { offset_minutes: 30 }, -1),
                due_in(EventKind::Reminder { offset_minutes: 5 }, 20),
            ],
        )
        .await;

        let now = OffsetDateTime::now_utc();
        let first = daemon.run_cycle(now).await;
        assert_eq!((first.due, first.dispatched), (1, 1));

        let second = daemon.run_cycle(now).await;
        assert_eq!(second, CycleReport::default());
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_is_retried_next_cycle() {
        let (state, store, recorder, daemon) = setup(AppConfig::default()).await;
        seed(
            &store,
            GameStatus::Scheduled,
            vec![due_in(EventKind::Reminder { offset_minutes: 10 }, -2)],
        )
        .await;

        *recorder.fail.lock().unwrap() = true;
        let failed = daemon.run_cycle(OffsetDateTime::now_utc()).await;
        assert_eq!(failed.failed, 1);

        *recorder.fail.lock().unwrap() = false;
        let retried = daemon.run_cycle(OffsetDateTime::now_utc()).await;
        assert_eq!(retried.dispatched, 1);

        let snapshot = state.telemetry().snapshot().await;
        assert_eq!(snapshot.counters["reminder"].failed, 1);
        assert_eq!(snapshot.counters["reminder"].dispatched, 1);
    }

    #[tokio::test]
    async fn transitions_move_the_game_status() {
        let (_state, store, recorder, daemon) = setup(AppConfig::default()).await;
        let game_id = seed(
            &store,
            GameStatus::Scheduled,
            vec![due_in(
                EventKind::StatusTransition {
                    target: GameStatus::InProgress,
                },
                0,
            )],
        )
        .await;

        let report = daemon.run_cycle(OffsetDateTime::now_utc()).await;
        assert_eq!(report.dispatched, 1);

        let game = store.find_game(game_id).await.unwrap().unwrap();
        assert_eq!(game.status, GameStatus::InProgress);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].from, Some(GameStatus::Scheduled));
        assert_eq!(sent[0].to, Some(GameStatus::InProgress));
    }

    #[tokio::test]
    async fn stale_transition_is_retired_without_dispatch() {
        let (_state, store, recorder, daemon) = setup(AppConfig::default()).await;
        let game_id = seed(
            &store,
            GameStatus::Cancelled,
            vec![due_in(
                EventKind::StatusTransition {
                    target: GameStatus::Completed,
                },
                -1,
            )],
        )
        .await;

        let report = daemon.run_cycle(OffsetDateTime::now_utc()).await;
        assert_eq!(report.skipped, 1);
        assert!(recorder.sent.lock().unwrap().is_empty());

        let events = store.list_events(game_id).await.unwrap();
        assert!(events[0].applied);
        let game = store.find_game(game_id).await.unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Cancelled);
    }

    #[tokio::test]
    async fn degraded_state_skips_cycles() {
        let (state, store, recorder, daemon) = setup(AppConfig::default()).await;
        seed(
            &store,
            GameStatus::Scheduled,
            vec![due_in(EventKind::Reminder { offset_minutes: 10 }, -2)],
        )
        .await;

        state.update_degraded(true);
        assert_eq!(
            daemon.run_cycle(OffsetDateTime::now_utc()).await,
            CycleReport::default()
        );
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn backlog_requires_a_full_batch_with_progress() {
        let full = CycleReport {
            due: 10,
            dispatched: 4,
            failed: 6,
            ..CycleReport::default()
        };
        assert!(full.has_backlog(10));
        assert!(!full.has_backlog(20));

        let stuck = CycleReport {
            due: 10,
            failed: 10,
            ..CycleReport::default()
        };
        assert!(!stuck.has_backlog(10));
    }

    #[tokio::test]
    async fn hint_wakes_the_loop_and_shutdown_stops_it() {
        let config = AppConfig {
            poll_interval: Duration::from_secs(3_600),
            ..AppConfig::default()
        };
        let (state, store, recorder, daemon) = setup(config).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(shutdown_rx));

        // Let the startup cycle run against the empty store.
        while state.telemetry().snapshot().await.cycles < 1 {
            tokio::task::yield_now().await;
        }

        let game_id = seed(
            &store,
            GameStatus::Scheduled,
            vec![due_in(EventKind::Reminder { offset_minutes: 15 }, -1)],
        )
        .await;
        let rows = store.list_events(game_id).await.unwrap();
        state
            .wake_hub()
            .publish_near_term(&rows, OffsetDateTime::now_utc(), Duration::from_secs(600));

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("hint did not wake the daemon");

        shutdown_tx.send(true).unwrap();
        let phase = handle.await.unwrap();
        assert_eq!(phase, DaemonPhase::Stopped);
        assert_eq!(
            state.telemetry().snapshot().await.phase,
            DaemonPhase::Stopped
        );
    }
}
