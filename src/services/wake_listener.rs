use std::time::Duration;

use futures::StreamExt;
use rand::{Rng, rng};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    dao::schedule_store::WakeStream,
    state::{SharedState, WakeSignal},
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Wait between checks while no store is installed.
const STORE_WAIT: Duration = Duration::from_secs(1);

/// Forward database wake notifications into the in-process hub, resubscribing
/// in the background whenever the subscription drops.
///
/// Backends without a native channel make this task exit right away; the
/// write path publishes hints itself.
pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let channel = state.config().wake_channel.clone();
    let mut backoff = INITIAL_BACKOFF;
    let mut lost = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let Ok(store) = state.require_schedule_store().await else {
            if pause(STORE_WAIT, &mut shutdown).await {
                return;
            }
            continue;
        };

        match store.listen(channel.clone()).await {
            Ok(None) => {
                info!("storage backend has no wake channel; using in-process hints only");
                return;
            }
            Ok(Some(stream)) => {
                info!(channel = %channel, "subscribed to wake notifications");
                if lost {
                    state.wake_hub().publish(WakeSignal::Resubscribed);
                }
                backoff = INITIAL_BACKOFF;

                if forward(&state, stream, &mut shutdown).await {
                    return;
                }
                lost = true;
            }
            Err(err) => {
                warn!(channel = %channel, error = %err, "failed to subscribe to wake notifications");
            }
        }

        let delay = jittered(backoff);
        debug!(delay_ms = delay.as_millis() as u64, "resubscribing to wake notifications");
        if pause(delay, &mut shutdown).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Pump hints until the stream fails. Returns `true` on shutdown.
async fn forward(
    state: &SharedState,
    mut stream: WakeStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return true,
            item = stream.next() => match item {
                Some(Ok(hint)) => {
                    debug!(game_id = %hint.game_id, due_at = %hint.due_at, "wake notification");
                    state.wake_hub().publish(WakeSignal::Hint(hint));
                }
                Some(Err(err)) => {
                    warn!(error = %err, "wake subscription lost; falling back to polling");
                    return false;
                }
                None => {
                    warn!("wake subscription ended; falling back to polling");
                    return false;
                }
            },
        }
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `true` on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = sleep(delay) => false,
    }
}

/// Up to 50% extra on top of `base`.
fn jittered(base: Duration) -> Duration {
    let extra = rng().random_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream;
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{WakeHint, WakeOperation},
            schedule_store::MemoryScheduleStore,
            storage::StorageError,
        },
        state::AppState,
    };

    #[test]
    fn jitter_stays_within_half_the_base() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_secs(2));
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn forward_publishes_hints_until_the_stream_fails() {
        let state = AppState::new(AppConfig::default());
        let mut wake = state.wake_hub().subscribe();
        let (_tx, mut shutdown) = watch::channel(false);
        let hint = WakeHint {
            operation: WakeOperation::Update,
            game_id: Uuid::new_v4(),
            due_at: datetime!(2026-10-19 21:00 UTC),
        };
        let items = vec![
            Ok(hint.clone()),
            Err(StorageError::conflict("connection reset")),
            Ok(hint.clone()),
        ];

        let stopped = forward(&state, stream::iter(items).boxed(), &mut shutdown).await;

        assert!(!stopped);
        assert_eq!(wake.try_recv().unwrap(), WakeSignal::Hint(hint));
        assert!(wake.try_recv().is_err());
    }

    #[tokio::test]
    async fn memory_backend_has_no_channel() {
        let state = AppState::new(AppConfig::default());
        state
            .install_schedule_store(Arc::new(MemoryScheduleStore::new()))
            .await;
        let (_tx, shutdown) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(1), run(state, shutdown))
            .await
            .expect("listener should exit for a backend without notifications");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_store_until_shutdown() {
        let state = AppState::new(AppConfig::default());
        let (tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run(state, shutdown));

        sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
