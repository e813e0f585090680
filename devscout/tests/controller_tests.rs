//! End-to-end behavior of the controller and its HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use devscout::api::{ApiServer, ApiServerConfig, AppState};
use devscout::config::AppConfig;
use devscout::controller::Controller;
use devscout::feeder::{FeederConfig, SourceConfig};
use devscout::pipeline::{ProcessorConfig, StageConfig, WorkItem};
use devscout::store::{DeviceStore, MemoryStore};

/// Two stages that never touch the network.
fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.controller.tick_interval_secs = 1;
    config.controller.idle_heartbeat_secs = 1;
    config.stages = vec![
        StageConfig {
            name: "first".into(),
            processor: ProcessorConfig::LocationRecorder,
            max_workers: None,
        },
        StageConfig {
            name: "second".into(),
            processor: ProcessorConfig::LocationRecorder,
            max_workers: None,
        },
    ];
    config
}

fn controller_with(config: &AppConfig) -> Arc<Controller> {
    let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
    Arc::new(Controller::new(config, store).unwrap())
}

fn fill(controller: &Controller, count: usize) {
    for n in 0..count {
        let item = WorkItem::new("192.0.2.1".parse().unwrap(), (n % 60000) as u16 + 1, "test");
        controller.input_queue().put(item, None);
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn deep_queue_creates_ten_workers_with_sequential_ids() {
    let controller = controller_with(&test_config());
    fill(&controller, 500);

    let report = controller.tick();
    assert_eq!(report.depths[0], 500);
    let first = &report.stages[0];
    assert_eq!(first.ideal, 10);
    assert_eq!(first.outcome.created, 10);
    assert_eq!(first.outcome.delta(), 10);
    assert_eq!(controller.worker_ids()["first"], (0..10).collect::<Vec<_>>());

    controller.shutdown().await;
}

#[tokio::test]
async fn empty_queue_stops_active_workers_then_resumes_them() {
    let controller = controller_with(&test_config());
    fill(&controller, 15);

    let report = controller.tick();
    assert_eq!(report.stages[0].ideal, 2);
    assert_eq!(report.stages[0].outcome.created, 2);

    let queue = controller.input_queue().clone();
    eventually(|| queue.is_empty()).await;

    let report = controller.tick();
    assert_eq!(report.stages[0].active, 2);
    assert_eq!(report.stages[0].ideal, 0);
    assert_eq!(report.stages[0].outcome.delta(), -2);
    assert_eq!(controller.status().workers["first"], 0);

    // Paused workers are reused before any new one is created.
    fill(&controller, 15);
    let report = controller.tick();
    assert_eq!(report.stages[0].outcome.resumed, 2);
    assert_eq!(report.stages[0].outcome.created, 0);
    assert_eq!(controller.worker_ids()["first"], vec![0, 1]);

    controller.shutdown().await;
}

#[tokio::test]
async fn max_workers_caps_the_ideal() {
    let mut config = test_config();
    config.stages[0].max_workers = Some(3);
    let controller = controller_with(&config);
    fill(&controller, 500);

    let report = controller.tick();
    assert_eq!(report.stages[0].ideal, 3);
    assert_eq!(controller.worker_ids()["first"], vec![0, 1, 2]);

    controller.shutdown().await;
}

#[tokio::test]
async fn stop_request_drains_and_ends_the_loop() {
    let controller = controller_with(&test_config());
    fill(&controller, 50);

    let run = tokio::spawn(controller.clone().run());
    eventually(|| controller.status().workers["first"] > 0).await;

    controller.request_stop();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("controller loop did not exit")
        .unwrap();

    assert!(!controller.is_running());
    assert!(controller.worker_ids().values().all(Vec::is_empty));
}

#[tokio::test]
async fn stop_request_zeroes_every_ideal_despite_backlog() {
    let controller = controller_with(&test_config());
    fill(&controller, 1000);
    let report = controller.tick();
    assert_eq!(report.stages[0].outcome.created, 10);

    controller.request_stop();
    fill(&controller, 1000);
    let report = controller.tick();
    assert!(report.depths[0] > 0);
    assert!(report.stages.iter().all(|stage| stage.ideal == 0));
    assert_eq!(report.stages[0].outcome.delta(), -10);
    assert_eq!(controller.status().workers["first"], 0);

    controller.shutdown().await;
}

#[tokio::test]
async fn target_file_feeder_fills_first_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets.txt");
    std::fs::write(&path, "# seed\n192.0.2.10:8080\n192.0.2.11 80 mac=AA:BB:CC:DD:EE:FF\n\n").unwrap();

    let mut config = test_config();
    config.feeders = vec![FeederConfig {
        kind: "targets".into(),
        regions: Vec::new(),
        pacing_ms: Some(0),
        level: Some(0),
        autostart: false,
        source: SourceConfig::TargetFile {
            path: path.display().to_string(),
        },
    }];
    let controller = controller_with(&config);

    assert_eq!(controller.start_feeder("targets").await.unwrap(), 1);
    let queue = controller.input_queue().clone();
    eventually(|| queue.size(0) == 2).await;

    let log = controller.command_log();
    assert_eq!(log.len(), 1);
    assert!(log[0].ends_with("START targets: true"));

    controller.shutdown().await;
}

async fn send(router: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn post(uri: &str, feeder: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(kind) = feeder {
        builder = builder.header("Feeder", kind);
    }
    builder.body(Body::empty()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn api_reports_status_and_logs_feeder_commands() {
    let controller = controller_with(&test_config());
    let state = AppState::new().with_controller(controller.clone());
    let router = ApiServer::with_state(ApiServerConfig::default(), state).build_router();

    let (status, body) = send(router.clone(), get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Queues"], json!([0, 0]));
    assert_eq!(body["Workers"], json!({"first": 0, "second": 0}));
    assert_eq!(body["Feeders"]["rescan"], json!(0));

    let (_, body) = send(router.clone(), post("/start_feeder", Some("UnknownKind"))).await;
    assert_eq!(body, json!({"result": false}));
    let (_, body) = send(router.clone(), post("/stop_feeder", Some("rescan"))).await;
    assert_eq!(body, json!({"result": false}));
    let (_, body) = send(router.clone(), post("/stop_feeder", None)).await;
    assert_eq!(body, json!({"result": false}));

    let (status, body) = send(router.clone(), get("/log")).await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<String> = serde_json::from_value(body).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries[0].ends_with("START UnknownKind: false"));
    assert!(entries[1].ends_with("STOP rescan: false"));
    assert!(entries[2].ends_with("STOP : false"));

    let (status, body) = send(router, get("/status_db")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Devices"]["Total"], 0);

    controller.shutdown().await;
}

#[tokio::test]
async fn api_stop_clears_run_flag_and_rejects_commands() {
    let controller = controller_with(&test_config());
    let state = AppState::new().with_controller(controller.clone());
    let token = state.shutdown.clone();
    let router = ApiServer::with_state(ApiServerConfig::default(), state).build_router();

    let (_, body) = send(router.clone(), post("/stop", None)).await;
    assert_eq!(body, json!({"result": "ok"}));
    assert!(!controller.is_running());
    assert!(token.is_cancelled());

    let (_, body) = send(router.clone(), post("/start_feeder", Some("rescan"))).await;
    assert_eq!(body, json!({"result": false}));
    let (_, body) = send(router, get("/log")).await;
    assert_eq!(body, json!([]));
}
