#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use game_scheduler::{
    config::AppConfig,
    dao::schedule_store::MemoryScheduleStore,
    dto::delivery::Delivery,
    services::{
        daemon::PollingDaemon,
        dispatcher::{DispatchError, Dispatcher},
    },
    state::{AppState, SharedState},
};

/// Dispatcher keeping every delivery in memory, optionally failing them all.
#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<Delivery>>,
    pub fail: Mutex<bool>,
}

impl Recorder {
    pub fn sent(&self) -> Vec<Delivery> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

pub struct RecordingDispatcher(pub Arc<Recorder>);

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

pub struct Harness {
    pub state: SharedState,
    pub store: MemoryScheduleStore,
    pub recorder: Arc<Recorder>,
    pub daemon: PollingDaemon,
}

/// Shared state backed by a fresh memory store, out of degraded mode.
pub async fn harness() -> Harness {
    let state = AppState::new(AppConfig::default());
    let store = MemoryScheduleStore::new();
    state.install_schedule_store(Arc::new(store.clone())).await;
    let recorder = Arc::new(Recorder::default());
    let daemon = PollingDaemon::new(
        state.clone(),
        Arc::new(RecordingDispatcher(recorder.clone())),
    );

    Harness {
        state,
        store,
        recorder,
        daemon,
    }
}
