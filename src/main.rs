//! game-scheduler binary entrypoint wiring the REST API, the schedule store
//! and the polling daemon.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use futures::{
    FutureExt,
    future::{self, BoxFuture},
};
use tokio::{net::TcpListener, sync::watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use game_scheduler::{
    config::AppConfig,
    dao::{
        schedule_store::{MemoryScheduleStore, ScheduleStore},
        storage::StorageResult,
    },
    routes,
    services::{daemon::PollingDaemon, dispatcher, storage_supervisor, wake_listener},
    state::AppState,
};

type Connect = Box<dyn FnMut() -> BoxFuture<'static, StorageResult<Arc<dyn ScheduleStore>>> + Send>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let connect = store_connector(&config).await?;
    let app_state = AppState::new(config);
    let dispatcher = dispatcher::build_dispatcher(
        &app_state.config().dispatcher,
        app_state.deliveries().clone(),
    )
    .context("building the delivery dispatcher")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(storage_supervisor::run(app_state.clone(), connect));
    tokio::spawn(wake_listener::run(app_state.clone(), shutdown_rx.clone()));
    let daemon = tokio::spawn(PollingDaemon::new(app_state.clone(), dispatcher).run(shutdown_rx));

    let app = routes::app(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    info!("HTTP server stopped; draining the daemon");
    let _ = shutdown_tx.send(true);
    let phase = daemon.await.context("joining the polling daemon")?;
    info!(?phase, "daemon stopped");

    Ok(())
}

/// Pick the storage backend from `STORE_BACKEND` (postgres, mongo or memory).
async fn store_connector(config: &AppConfig) -> anyhow::Result<Connect> {
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".into());
    info!(%backend, "selected storage backend");

    match backend.as_str() {
        #[cfg(feature = "postgres-store")]
        "postgres" => {
            use game_scheduler::dao::schedule_store::postgres::PgConfig;

            let pg = PgConfig::from_env()
                .context("reading PostgreSQL settings")?
                .with_wake(config.wake_channel.clone(), config.near_term_horizon);
            Ok(Box::new(move || connect_postgres(pg.clone()).boxed()))
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            use game_scheduler::dao::schedule_store::mongodb::MongoConfig;

            let mongo = MongoConfig::from_env()
                .await
                .context("reading MongoDB settings")?;
            Ok(Box::new(move || connect_mongo(mongo.clone()).boxed()))
        }
        "memory" => {
            let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
            Ok(Box::new(move || future::ready(StorageResult::Ok(store.clone())).boxed()))
        }
        other => bail!("unsupported STORE_BACKEND `{other}`"),
    }
}

#[cfg(feature = "postgres-store")]
async fn connect_postgres(
    config: game_scheduler::dao::schedule_store::postgres::PgConfig,
) -> StorageResult<Arc<dyn ScheduleStore>> {
    use game_scheduler::dao::schedule_store::postgres::PostgresScheduleStore;

    let store = PostgresScheduleStore::connect(config).await?;
    Ok(Arc::new(store))
}

#[cfg(feature = "mongo-store")]
async fn connect_mongo(
    config: game_scheduler::dao::schedule_store::mongodb::MongoConfig,
) -> StorageResult<Arc<dyn ScheduleStore>> {
    use game_scheduler::dao::schedule_store::mongodb::MongoScheduleStore;

    let store = MongoScheduleStore::connect(config).await?;
    Ok(Arc::new(store))
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
