//! Integration tests for the fleet presence engine
//!
//! These tests validate cross-component interactions and real network behavior.

use fleetcast_client::network::{ClientError, FleetClient};
use fleetcast_server::config::ServerConfig;
use fleetcast_server::hub::DisconnectReason;
use fleetcast_server::network::Server;
use fleetcast_server::persistence::{FileBackend, MemoryBackend, PresenceBackend};
use fleetcast_server::snapshot::{HtmlMapRenderer, MemoryArtifact, SnapshotScheduler};
use fleetcast_server::{
    BroadcastHub, HubConfig, OverflowPolicy, PresenceError, PresenceStore, PresenceUpdater,
    QueryService,
};
use fleetcast_shared::{ChannelMessage, Location, PositionReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Engine {
    backend: Arc<MemoryBackend>,
    store: Arc<PresenceStore>,
    hub: Arc<BroadcastHub>,
    updater: Arc<PresenceUpdater>,
    query: QueryService,
}

fn engine_with(config: HubConfig) -> Engine {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(PresenceStore::new(backend.clone()));
    let hub = Arc::new(BroadcastHub::new(config));
    let updater = Arc::new(PresenceUpdater::new(Arc::clone(&store), Arc::clone(&hub)));
    let query = QueryService::new(Arc::clone(&store));

    Engine {
        backend,
        store,
        hub,
        updater,
        query,
    }
}

fn engine() -> Engine {
    engine_with(HubConfig::default())
}

/// ACCEPTANCE SCENARIOS
mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn scenario_a_report_is_readable() {
        let engine = engine();
        engine
            .updater
            .apply(&PositionReport::new("u1", 10.0, 20.0))
            .await
            .unwrap();

        let view = engine.query.get("u1").unwrap();
        assert_eq!(view.location, Some(Location::new(10.0, 20.0, 0.0)));
        assert!(view.online);
    }

    #[tokio::test]
    async fn scenario_b_rejected_report_creates_nothing() {
        let engine = engine();
        let err = engine
            .updater
            .apply(&PositionReport::new("u1", 200.0, 20.0))
            .await
            .unwrap_err();

        assert!(err.is_client_error());
        assert!(matches!(
            engine.query.get("u1"),
            Err(PresenceError::NotFound(_))
        ));
        assert!(engine.backend.is_empty());
    }

    #[tokio::test]
    async fn scenario_c_subscriber_gets_exactly_one_event() {
        let engine = engine();
        let observer = engine.hub.subscribe();

        engine
            .updater
            .apply(&PositionReport::new("u2", -5.0, -5.0))
            .await
            .unwrap();

        let event = observer.recv().await.unwrap();
        assert_eq!(event.id, "u2");
        assert_eq!(event.location, Location::new(-5.0, -5.0, 0.0));
        assert!(event.online);
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scenario_d_concurrent_writes_never_mix() {
        for _ in 0..20 {
            let engine = engine();
            let first = Arc::clone(&engine.updater);
            let second = Arc::clone(&engine.updater);

            let (a, b) = tokio::join!(
                tokio::spawn(async move {
                    first.apply(&PositionReport::new("u1", 1.0, 2.0)).await
                }),
                tokio::spawn(async move {
                    second.apply(&PositionReport::new("u1", 3.0, 4.0)).await
                }),
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();

            let location = engine.query.get("u1").unwrap().location.unwrap();
            assert!(
                (location.lat, location.lng) == (1.0, 2.0)
                    || (location.lat, location.lng) == (3.0, 4.0),
                "hybrid location {:?}",
                location
            );
        }
    }
}

/// PRESENCE PIPELINE TESTS
mod pipeline_tests {
    use super::*;

    /// A first report creates the record, reaches observers and is queryable
    #[tokio::test]
    async fn first_report_is_stored_broadcast_and_listed() {
        let engine = engine();
        let observer = engine.hub.subscribe();

        let report = PositionReport::new("truck-7", 52.52, 13.405).with_accuracy(8.0);
        let event = engine.updater.apply_at(&report, 1_000).await.unwrap();

        assert_eq!(event.id, "truck-7");
        assert!(event.online);
        assert_eq!(event.last_seen, 1_000);

        let received = observer.try_recv().unwrap();
        assert_eq!(received, event);
        assert!(observer.try_recv().is_none());

        let users = engine.query.list_all();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "truck-7");
        assert_eq!(users[0].location, Some(Location::new(52.52, 13.405, 8.0)));
        assert!(users[0].online);

        assert_eq!(engine.backend.get("truck-7").unwrap().last_seen, 1_000);
    }

    /// A later report replaces location and liveness of an existing record
    #[tokio::test]
    async fn later_report_replaces_previous_state() {
        let engine = engine();

        engine
            .updater
            .apply_at(&PositionReport::new("van-1", 10.0, 10.0), 100)
            .await
            .unwrap();
        engine
            .updater
            .apply_at(
                &PositionReport::new("van-1", 11.0, 12.0).with_online(false),
                200,
            )
            .await
            .unwrap();

        let view = engine.query.get("van-1").unwrap();
        assert_eq!(view.location, Some(Location::new(11.0, 12.0, 0.0)));
        assert!(!view.online);
        assert_eq!(engine.store.len(), 1);
    }

    /// An invalid report changes nothing and produces no event
    #[tokio::test]
    async fn invalid_report_is_rejected_without_side_effects() {
        let engine = engine();
        let observer = engine.hub.subscribe();

        engine
            .updater
            .apply_at(&PositionReport::new("bike-3", 1.0, 1.0), 100)
            .await
            .unwrap();
        let _ = observer.try_recv();

        let bad_reports = vec![
            PositionReport::new("bike-3", 91.0, 0.0),
            PositionReport::new("bike-3", 0.0, -180.5),
            PositionReport::new("", 0.0, 0.0),
            PositionReport::new("bike-3", 0.0, 0.0).with_accuracy(-1.0),
            PositionReport {
                id: Some("bike-3".to_string()),
                lat: Some(1.0),
                ..Default::default()
            },
        ];

        for report in &bad_reports {
            let err = engine.updater.apply_at(report, 200).await.unwrap_err();
            assert!(
                matches!(err, PresenceError::InvalidReport(_)),
                "unexpected error {:?}",
                err
            );
        }

        let view = engine.query.get("bike-3").unwrap();
        assert_eq!(view.location, Some(Location::new(1.0, 1.0, 0.0)));
        assert!(observer.try_recv().is_none());
        assert_eq!(engine.store.get("bike-3").unwrap().last_seen, 100);
    }

    /// A failed mirror write rejects the report and leaves state untouched
    #[tokio::test]
    async fn persistence_failure_rejects_report() {
        let engine = engine();
        let observer = engine.hub.subscribe();

        engine
            .updater
            .apply_at(&PositionReport::new("ship-2", 30.0, 40.0), 100)
            .await
            .unwrap();
        let _ = observer.try_recv();

        engine.backend.set_unavailable(true);
        let err = engine
            .updater
            .apply_at(&PositionReport::new("ship-2", 31.0, 41.0), 200)
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::Persistence(_)));
        assert!(!err.is_client_error());

        let err = engine
            .updater
            .apply_at(&PositionReport::new("ship-new", 0.0, 0.0), 200)
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::Persistence(_)));

        assert!(observer.try_recv().is_none());
        assert_eq!(
            engine.query.get("ship-2").unwrap().location,
            Some(Location::new(30.0, 40.0, 0.0))
        );
        assert!(matches!(
            engine.query.get("ship-new"),
            Err(PresenceError::NotFound(_))
        ));

        engine.backend.set_unavailable(false);
        engine
            .updater
            .apply_at(&PositionReport::new("ship-2", 31.0, 41.0), 300)
            .await
            .unwrap();
        assert_eq!(observer.try_recv().unwrap().location.lat, 31.0);
    }

    /// Concurrent reports for one id reach observers in commit order
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_keep_per_id_order() {
        let engine = engine_with(HubConfig {
            buffer_capacity: 1024,
            ..Default::default()
        });
        let observer = engine.hub.subscribe();

        let mut tasks = Vec::new();
        for i in 0..200u64 {
            let updater = Arc::clone(&engine.updater);
            tasks.push(tokio::spawn(async move {
                let lat = (i as f64) / 10.0;
                updater
                    .apply_at(&PositionReport::new("shared-id", lat, lat), 1_000 + i)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut events = Vec::new();
        while let Some(event) = observer.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 200);

        // last_seen never goes backwards in delivery order
        for pair in events.windows(2) {
            assert!(pair[0].last_seen <= pair[1].last_seen);
        }

        // The last delivered event is the committed state
        let last = events.last().unwrap();
        let record = engine.store.get("shared-id").unwrap();
        assert_eq!(record.location, Some(last.location));
        assert_eq!(record.last_seen, last.last_seen);
        assert_eq!(engine.backend.get("shared-id").unwrap(), record);
    }

    /// Reports for different ids proceed independently
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_ids_are_all_tracked() {
        let engine = engine();

        let mut tasks = Vec::new();
        for i in 0..50 {
            let updater = Arc::clone(&engine.updater);
            tasks.push(tokio::spawn(async move {
                let id = format!("device-{:02}", i);
                updater
                    .apply(&PositionReport::new(id, 1.0, 2.0))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let users = engine.query.list_all();
        assert_eq!(users.len(), 50);
        assert_eq!(users[0].id, "device-00");
        assert_eq!(users[49].id, "device-49");
    }
}

/// OBSERVER ISOLATION TESTS
mod observer_tests {
    use super::*;

    /// A slow observer loses events but never delays a fast one
    #[tokio::test]
    async fn slow_observer_does_not_affect_fast_observer() {
        let engine = engine_with(HubConfig {
            buffer_capacity: 4,
            overflow: OverflowPolicy::DropOldest,
            delivery_timeout: Duration::from_secs(60),
        });
        let fast = engine.hub.subscribe();
        let slow = engine.hub.subscribe();

        let mut fast_seen = Vec::new();
        for i in 0..20u64 {
            engine
                .updater
                .apply_at(&PositionReport::new("car", i as f64, 0.0), i)
                .await
                .unwrap();
            while let Some(event) = fast.try_recv() {
                fast_seen.push(event.location.lat);
            }
        }

        assert_eq!(fast_seen.len(), 20);
        assert_eq!(fast.dropped(), 0);

        // The slow observer kept only the newest events, still in order
        let mut slow_seen = Vec::new();
        while let Some(event) = slow.try_recv() {
            slow_seen.push(event.location.lat);
        }
        assert_eq!(slow_seen, vec![16.0, 17.0, 18.0, 19.0]);
        assert_eq!(slow.dropped(), 16);
        assert!(slow.disconnect_reason().is_none());
    }

    /// An observer that stays full past the delivery timeout is disconnected
    #[tokio::test]
    async fn stalled_observer_is_disconnected() {
        let engine = engine_with(HubConfig {
            buffer_capacity: 2,
            overflow: OverflowPolicy::DropNewest,
            delivery_timeout: Duration::from_millis(50),
        });
        let stalled = engine.hub.subscribe();
        let healthy = engine.hub.subscribe();

        for i in 0..3u64 {
            engine
                .updater
                .apply_at(&PositionReport::new("tram", 1.0, i as f64), i)
                .await
                .unwrap();
            while healthy.try_recv().is_some() {}
        }

        sleep(Duration::from_millis(80)).await;
        engine
            .updater
            .apply_at(&PositionReport::new("tram", 1.0, 9.0), 10)
            .await
            .unwrap();

        assert_eq!(
            stalled.disconnect_reason(),
            Some(DisconnectReason::DeliveryTimeout)
        );
        assert!(stalled.recv().await.is_none());
        assert_eq!(engine.hub.observer_count(), 1);
        assert_eq!(healthy.try_recv().unwrap().location.lng, 9.0);
    }

    /// Unsubscribing during traffic neither fails publishes nor leaks slots
    #[tokio::test]
    async fn unsubscribe_during_traffic() {
        let engine = engine();
        let observers: Vec<_> = (0..10).map(|_| engine.hub.subscribe()).collect();
        assert_eq!(engine.hub.observer_count(), 10);

        for (i, observer) in observers.iter().enumerate() {
            engine
                .updater
                .apply(&PositionReport::new("bus", i as f64, 0.0))
                .await
                .unwrap();
            engine.hub.unsubscribe(observer);
        }

        assert_eq!(engine.hub.observer_count(), 0);
        for observer in &observers {
            assert_eq!(
                observer.disconnect_reason(),
                Some(DisconnectReason::Unsubscribed)
            );
        }
    }
}

/// SNAPSHOT TESTS
mod snapshot_tests {
    use super::*;
    use tokio::sync::watch;

    /// Snapshots are produced on cadence regardless of report traffic
    #[tokio::test(start_paused = true)]
    async fn snapshot_cadence_without_traffic() {
        let engine = engine();
        engine
            .updater
            .apply_at(&PositionReport::new("idle", 5.0, 5.0), 1)
            .await
            .unwrap();

        let artifact = Arc::new(MemoryArtifact::new());
        let scheduler = Arc::new(SnapshotScheduler::new(
            Arc::clone(&engine.store),
            Arc::new(HtmlMapRenderer::default()),
            artifact.clone(),
            Duration::from_secs(5),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&scheduler).spawn(shutdown_rx);

        sleep(Duration::from_secs(30)).await;
        let completed = scheduler.completed_ticks();
        assert!(
            (6..=7).contains(&completed),
            "expected 6 or 7 ticks, got {}",
            completed
        );
        assert_eq!(artifact.version(), completed);

        let html = String::from_utf8(artifact.latest().unwrap().to_vec()).unwrap();
        assert!(html.contains("User: idle"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// A snapshot reflects the current fleet including offline members
    #[tokio::test]
    async fn snapshot_reflects_fleet_state() {
        let engine = engine();
        engine
            .updater
            .apply_at(&PositionReport::new("on", 10.0, 20.0), 1)
            .await
            .unwrap();
        engine
            .updater
            .apply_at(&PositionReport::new("off", -10.0, -20.0).with_online(false), 1)
            .await
            .unwrap();

        let artifact = Arc::new(MemoryArtifact::new());
        let scheduler = SnapshotScheduler::new(
            Arc::clone(&engine.store),
            Arc::new(HtmlMapRenderer::default()),
            artifact.clone(),
            Duration::from_secs(5),
        );

        assert_eq!(scheduler.tick().await.unwrap(), 2);
        let html = String::from_utf8(artifact.latest().unwrap().to_vec()).unwrap();
        assert!(html.contains("color: 'green'"));
        assert!(html.contains("color: 'red'"));
        assert!(html.contains("User: on"));
        assert!(html.contains("User: off"));
    }

    /// An empty fleet still renders the base map
    #[tokio::test]
    async fn empty_fleet_renders_base_map() {
        let engine = engine();
        let artifact = Arc::new(MemoryArtifact::new());
        let scheduler = SnapshotScheduler::new(
            Arc::clone(&engine.store),
            Arc::new(HtmlMapRenderer::default()),
            artifact.clone(),
            Duration::from_secs(5),
        );

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let html = String::from_utf8(artifact.latest().unwrap().to_vec()).unwrap();
        assert!(html.contains("setView([0, 0], 2)"));
        assert!(!html.contains("circleMarker"));
    }
}

/// PERSISTENCE TESTS
mod persistence_tests {
    use super::*;

    /// Records written through the file backend survive a restart
    #[tokio::test]
    async fn file_backend_restores_after_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let backend: Arc<dyn PresenceBackend> =
                Arc::new(FileBackend::open(dir.path()).await.unwrap());
            let store = Arc::new(PresenceStore::restore(backend).await.unwrap());
            let updater = PresenceUpdater::new(store, Arc::new(BroadcastHub::default()));

            updater
                .apply_at(&PositionReport::new("alpha", 1.5, 2.5).with_accuracy(4.0), 10)
                .await
                .unwrap();
            updater
                .apply_at(&PositionReport::new("beta/κ", -3.0, 4.0).with_online(false), 20)
                .await
                .unwrap();
            updater
                .apply_at(&PositionReport::new("alpha", 1.6, 2.6), 30)
                .await
                .unwrap();
        }

        let backend: Arc<dyn PresenceBackend> =
            Arc::new(FileBackend::open(dir.path()).await.unwrap());
        let store = Arc::new(PresenceStore::restore(backend).await.unwrap());
        let query = QueryService::new(Arc::clone(&store));

        let users = query.list_all();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "alpha");
        assert_eq!(users[0].location, Some(Location::new(1.6, 2.6, 0.0)));
        assert_eq!(users[1].id, "beta/κ");
        assert!(!users[1].online);
        assert_eq!(store.get("alpha").unwrap().last_seen, 30);
    }

    /// Ids far longer than a file name are accepted and restored
    #[tokio::test]
    async fn file_backend_accepts_long_ids() {
        let dir = tempfile::tempdir().unwrap();
        let long_id = "d".repeat(200);

        {
            let backend: Arc<dyn PresenceBackend> =
                Arc::new(FileBackend::open(dir.path()).await.unwrap());
            let store = Arc::new(PresenceStore::restore(backend).await.unwrap());
            let updater = PresenceUpdater::new(store, Arc::new(BroadcastHub::default()));

            updater
                .apply(&PositionReport::new(long_id.clone(), 10.0, 20.0))
                .await
                .unwrap();
        }

        let backend: Arc<dyn PresenceBackend> =
            Arc::new(FileBackend::open(dir.path()).await.unwrap());
        let store = PresenceStore::restore(backend).await.unwrap();
        let record = store.get(&long_id).unwrap();
        assert_eq!(record.location, Some(Location::new(10.0, 20.0, 0.0)));
        assert!(record.online);
    }
}

/// CLIENT-SERVER INTEGRATION TESTS
mod client_server_tests {
    use super::*;
    use async_trait::async_trait;
    use fleetcast_server::error::BackendError;
    use fleetcast_server::PresenceRecord;
    use tokio::sync::{mpsc, oneshot, Notify};
    use tokio::task::JoinHandle;

    /// Memory backend whose writes take a while to complete
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
        save_started: Notify,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryBackend::new(),
                delay,
                save_started: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl PresenceBackend for SlowBackend {
        async fn save(&self, record: &PresenceRecord) -> Result<(), BackendError> {
            self.save_started.notify_one();
            sleep(self.delay).await;
            self.inner.save(record).await
        }

        async fn load_all(&self) -> Result<Vec<PresenceRecord>, BackendError> {
            self.inner.load_all().await
        }
    }

    struct RunningServer {
        base: String,
        hub: Arc<BroadcastHub>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<(), String>>,
    }

    impl RunningServer {
        async fn stop(self) {
            self.stop.send(()).unwrap();
            self.task.await.unwrap().unwrap();
        }
    }

    async fn start_server(
        mut config: ServerConfig,
        backend: Arc<dyn PresenceBackend>,
    ) -> RunningServer {
        let port = free_port();
        config.bind_addr = format!("127.0.0.1:{}", port);

        let server = Server::with_backend(config, backend).await.unwrap();
        let hub = Arc::clone(&server.state().hub);
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
                .map_err(|e| e.to_string())
        });

        let base = format!("http://127.0.0.1:{}", port);
        wait_until_ready(&FleetClient::new(&base)).await;

        RunningServer {
            base,
            hub,
            stop,
            task,
        }
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn wait_until_ready(client: &FleetClient) {
        for _ in 0..100 {
            if client.list().await.is_ok() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not come up");
    }

    /// Full round trip: report over HTTP, observe over WebSocket, list, shut down
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn report_observe_and_list_over_network() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let config = ServerConfig {
            bind_addr: format!("127.0.0.1:{}", port),
            snapshot_path: dir.path().join("map.html"),
            ..Default::default()
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = Server::new(config).await.unwrap();
        let server_task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
                .map_err(|e| e.to_string())
        });

        let base = format!("http://127.0.0.1:{}", port);
        let client = FleetClient::new(&base);
        wait_until_ready(&client).await;

        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let watcher = FleetClient::new(&base);
        let watch_task = tokio::spawn(async move {
            watcher
                .watch(move |message| message_tx.send(message).is_ok())
                .await
        });

        let greeting = message_rx.recv().await.unwrap();
        assert_eq!(greeting, ChannelMessage::connected());

        client
            .report(&PositionReport::new("courier-1", 48.8566, 2.3522).with_accuracy(12.0))
            .await
            .unwrap();

        match message_rx.recv().await.unwrap() {
            ChannelMessage::LocationUpdate {
                id,
                lat,
                lng,
                accuracy,
                online,
            } => {
                assert_eq!(id, "courier-1");
                assert_eq!(lat, 48.8566);
                assert_eq!(lng, 2.3522);
                assert_eq!(accuracy, 12.0);
                assert!(online);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let rejected = client
            .report(&PositionReport::new("courier-1", 123.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(rejected, ClientError::Rejected(_)));

        let users = client.list().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "courier-1");
        assert_eq!(
            users[0].location,
            Some(Location::new(48.8566, 2.3522, 12.0))
        );

        stop_tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
        watch_task.await.unwrap().unwrap();

        // The first tick rendered right after startup
        assert!(dir.path().join("map.html").exists());
    }

    /// Shutdown lets a report whose mirror write is in progress complete
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_in_flight_report() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(300)));
        let config = ServerConfig {
            snapshot_path: dir.path().join("map.html"),
            ..Default::default()
        };
        let server = start_server(config, backend.clone()).await;

        let reporter = FleetClient::new(&server.base);
        let report = tokio::spawn(async move {
            reporter
                .report(&PositionReport::new("late", 1.0, 2.0))
                .await
        });

        backend.save_started.notified().await;
        server.stop().await;

        report.await.unwrap().unwrap();
        let record = backend.inner.get("late").unwrap();
        assert_eq!(record.location, Some(Location::new(1.0, 2.0, 0.0)));
    }

    /// Closing a realtime connection removes its observer from the hub
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_channel_unsubscribes_observer() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_path: dir.path().join("map.html"),
            ..Default::default()
        };
        let server = start_server(config, Arc::new(MemoryBackend::new())).await;
        assert_eq!(server.hub.observer_count(), 0);

        let watcher = FleetClient::new(&server.base);
        let mut observers_while_connected = None;
        watcher
            .watch(|message| {
                assert_eq!(message, ChannelMessage::connected());
                observers_while_connected = Some(server.hub.observer_count());
                false
            })
            .await
            .unwrap();
        assert_eq!(observers_while_connected, Some(1));

        let hub = Arc::clone(&server.hub);
        assert!(eventually(|| hub.observer_count() == 0).await);

        server.stop().await;
    }

    /// A stalled in-process observer is dropped even when traffic stops
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_observer_reaped_after_traffic_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_path: dir.path().join("map.html"),
            hub: HubConfig {
                buffer_capacity: 1,
                overflow: OverflowPolicy::DropOldest,
                delivery_timeout: Duration::from_millis(100),
            },
            ..Default::default()
        };
        let server = start_server(config, Arc::new(MemoryBackend::new())).await;
        let stalled = server.hub.subscribe();

        FleetClient::new(&server.base)
            .report(&PositionReport::new("once", 3.0, 4.0))
            .await
            .unwrap();

        assert!(eventually(|| stalled.disconnect_reason().is_some()).await);
        assert_eq!(
            stalled.disconnect_reason(),
            Some(DisconnectReason::DeliveryTimeout)
        );
        assert_eq!(server.hub.observer_count(), 0);

        server.stop().await;
    }
}
