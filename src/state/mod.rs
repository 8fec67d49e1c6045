/// Daemon lifecycle state machine.
pub mod daemon_phase;
mod sse;
/// Daemon counters.
pub mod telemetry;
mod wake;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{config::AppConfig, dao::schedule_store::ScheduleStore, error::ServiceError};

pub use self::daemon_phase::{DaemonEvent, DaemonPhase, DaemonStateMachine, WakeSource};
pub use self::sse::SseHub;
pub use self::telemetry::{DaemonTelemetry, DeliveryOutcome, KindCounters, TelemetrySnapshot};
pub use self::wake::{WakeHub, WakeSignal};

/// Handle passed to routes, services and background tasks.
pub type SharedState = Arc<AppState>;

const WAKE_CAPACITY: usize = 64;
const DELIVERY_CAPACITY: usize = 256;

/// Central application state: the schedule store handle, the wake and
/// delivery hubs, and the daemon telemetry.
pub struct AppState {
    schedule_store: RwLock<Option<Arc<dyn ScheduleStore>>>,
    degraded: watch::Sender<bool>,
    config: AppConfig,
    wake: WakeHub,
    deliveries: SseHub,
    telemetry: DaemonTelemetry,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            schedule_store: RwLock::new(None),
            degraded: degraded_tx,
            config,
            wake: WakeHub::new(WAKE_CAPACITY),
            deliveries: SseHub::new(DELIVERY_CAPACITY),
            telemetry: DaemonTelemetry::new(),
        })
    }

    /// Obtain a handle to the current schedule store, if one is installed.
    pub async fn schedule_store(&self) -> Option<Arc<dyn ScheduleStore>> {
        let guard = self.schedule_store.read().await;
        guard.as_ref().cloned()
    }

    /// Like [`Self::schedule_store`], failing with [`ServiceError::Degraded`]
    /// while no usable backend is installed.
    pub async fn require_schedule_store(&self) -> Result<Arc<dyn ScheduleStore>, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        self.schedule_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new schedule store implementation and leave degraded mode.
    pub async fn install_schedule_store(&self, store: Arc<dyn ScheduleStore>) {
        {
            let mut guard = self.schedule_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current schedule store and enter degraded mode.
    pub async fn clear_schedule_store(&self) {
        {
            let mut guard = self.schedule_store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Configuration loaded at startup.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Hub the daemon waits on.
    pub fn wake_hub(&self) -> &WakeHub {
        &self.wake
    }

    /// Broadcast hub behind `/deliveries/stream`.
    pub fn deliveries(&self) -> &SseHub {
        &self.deliveries
    }

    /// Daemon counters and cycle clock.
    pub fn telemetry(&self) -> &DaemonTelemetry {
        &self.telemetry
    }
}
