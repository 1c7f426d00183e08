//! HTTP and WebSocket transport around the presence engine
//!
//! Routes:
//! - `POST /update-position`: ingress for position reports
//! - `GET /get-users`: current presence set
//! - `GET /ws`: realtime channel, one broadcast observer per socket
//! - `GET /` and `GET /snapshot`: latest rendered fleet snapshot

use crate::config::ServerConfig;
use crate::error::PresenceError;
use crate::hub::{BroadcastHub, DisconnectReason};
use crate::persistence::{FileBackend, MemoryBackend, PresenceBackend};
use crate::query::QueryService;
use crate::snapshot::{FileArtifact, HtmlMapRenderer, SnapshotScheduler};
use crate::store::PresenceStore;
use crate::updater::PresenceUpdater;
use crate::utils::get_timestamp;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetcast_shared::{
    ChannelMessage, PositionReport, PresenceView, ReportResponse, CHANNEL_PATH, REPORT_PATH,
    SNAPSHOT_PATH, USERS_PATH,
};
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub updater: Arc<PresenceUpdater>,
    pub query: QueryService,
    pub hub: Arc<BroadcastHub>,
    pub snapshot: FileArtifact,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(REPORT_PATH, post(update_position))
        .route(USERS_PATH, get(get_users))
        .route(CHANNEL_PATH, get(channel))
        .route("/", get(snapshot))
        .route(SNAPSHOT_PATH, get(snapshot))
        .with_state(state)
}

async fn update_position(
    State(state): State<AppState>,
    payload: Result<Json<PositionReport>, JsonRejection>,
) -> (StatusCode, Json<ReportResponse>) {
    let report = match payload {
        Ok(Json(report)) => report,
        Err(rejection) => {
            warn!("Rejected malformed report: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(ReportResponse::error(rejection.body_text())),
            );
        }
    };

    match state.updater.apply(&report).await {
        Ok(_) => (StatusCode::OK, Json(ReportResponse::success())),
        Err(e) => e.into(),
    }
}

async fn get_users(State(state): State<AppState>) -> Json<Vec<PresenceView>> {
    Json(state.query.list_all())
}

async fn snapshot(State(state): State<AppState>) -> Response {
    match state.snapshot.read().await {
        Ok(Some(html)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response(),
        Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, "snapshot not rendered yet").into_response(),
        Err(e) => {
            error!("Failed to read snapshot: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_observer(socket, state))
}

/// Drives one realtime connection until the peer leaves, the observer is
/// dropped by the hub, or the server shuts down.
async fn serve_observer(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let handle = state.hub.subscribe();
    let delivery_timeout = state.hub.config().delivery_timeout;
    let mut shutdown = state.shutdown.clone();

    if !send_message(&mut sender, &ChannelMessage::connected(), delivery_timeout).await {
        state.hub.unsubscribe(&handle);
        return;
    }

    loop {
        tokio::select! {
            event = handle.recv() => {
                let Some(event) = event else {
                    debug!("Observer {} closed by hub ({:?})", handle.id(), handle.disconnect_reason());
                    break;
                };
                if !send_message(&mut sender, &event.to_message(), delivery_timeout).await {
                    state.hub.disconnect(handle.id(), DisconnectReason::DeliveryTimeout);
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.unsubscribe(&handle);
}

/// Sends one JSON message, giving up after `limit`. Returns false when the
/// connection should be dropped.
async fn send_message<S>(sender: &mut S, message: &ChannelMessage, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode channel message: {}", e);
            return true;
        }
    };

    match timeout(limit, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            warn!("Socket send exceeded {:?}", limit);
            false
        }
    }
}

/// Owns the engine and its background tasks.
pub struct Server {
    config: ServerConfig,
    state: AppState,
    scheduler: Arc<SnapshotScheduler>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Builds a server on the backend selected by `config.data_dir`.
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let backend: Arc<dyn PresenceBackend> = match &config.data_dir {
            Some(dir) => {
                info!("Persisting presence records under {}", dir.display());
                Arc::new(FileBackend::open(dir).await?)
            }
            None => {
                info!("No data directory configured, presence is kept in memory");
                Arc::new(MemoryBackend::new())
            }
        };
        Self::with_backend(config, backend).await
    }

    /// Builds a server that mirrors presence records to `backend`.
    pub async fn with_backend(
        config: ServerConfig,
        backend: Arc<dyn PresenceBackend>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(PresenceStore::restore(backend).await?);
        let hub = Arc::new(BroadcastHub::new(config.hub.clone()));
        let updater = Arc::new(
            PresenceUpdater::new(Arc::clone(&store), Arc::clone(&hub))
                .with_staleness(config.staleness),
        );

        let snapshot = FileArtifact::new(config.snapshot_path.clone());
        let scheduler = Arc::new(SnapshotScheduler::new(
            Arc::clone(&store),
            Arc::new(HtmlMapRenderer::new(config.map_center, config.map_zoom)),
            Arc::new(snapshot.clone()),
            config.snapshot_interval,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState {
            updater,
            query: QueryService::new(store),
            hub,
            snapshot,
            shutdown: shutdown_rx,
        };

        Ok(Server {
            config,
            state,
            scheduler,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Spawns the task that demotes entities whose reports have stopped
    fn spawn_staleness_sweeper(&self) -> Option<JoinHandle<()>> {
        let staleness = self.config.staleness?;
        let updater = Arc::clone(&self.state.updater);
        let mut shutdown = self.state.shutdown.clone();
        let period = (staleness / 4).max(Duration::from_secs(1));

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let demoted = updater.sweep_stale(get_timestamp()).await;
                        if !demoted.is_empty() {
                            debug!("Staleness sweep demoted {} entities", demoted.len());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }

    /// Spawns the task that disconnects observers which stopped draining
    fn spawn_observer_reaper(&self) -> JoinHandle<()> {
        let hub = Arc::clone(&self.state.hub);
        let mut shutdown = self.state.shutdown.clone();
        let period = (hub.config().delivery_timeout / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = hub.reap_stalled();
                        if reaped > 0 {
                            debug!("Reaped {} stalled observers", reaped);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Serves until `signal` resolves, then drains in-flight requests.
    pub async fn run_until<F>(self, signal: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let scheduler_handle = Arc::clone(&self.scheduler).spawn(self.state.shutdown.clone());
        let sweeper_handle = self.spawn_staleness_sweeper();
        let reaper_handle = self.spawn_observer_reaper();

        let shutdown_tx = self.shutdown_tx;
        let app = router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("Shutting down, draining in-flight reports");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        if let Err(e) = scheduler_handle.await {
            error!("Snapshot scheduler task panicked: {}", e);
        }
        if let Err(e) = reaper_handle.await {
            error!("Observer reaper task panicked: {}", e);
        }
        if let Some(handle) = sweeper_handle {
            if let Err(e) = handle.await {
                error!("Staleness sweeper task panicked: {}", e);
            }
        }

        info!("Server stopped");
        Ok(())
    }

    /// Serves until Ctrl+C.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }
}

impl From<PresenceError> for (StatusCode, Json<ReportResponse>) {
    fn from(e: PresenceError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(ReportResponse::error(e.to_string())))
    }
}
