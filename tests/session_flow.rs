//! End-to-end tests for the client session plane: a real WebSocket server
//! with a scripted in-process executor standing in for the runner service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crucible::config::OrchestratorConfig;
use crucible::external::{
    KeyFormatDetector, StructuralValidator, TemplateDocGenerator, TemplateImprovementGenerator,
    default_synthesizers,
};
use crucible::generate::GenerationCoordinator;
use crucible::link::TestExecutor;
use crucible::protocol::runner::TestResult;
use crucible::protocol::Test;
use crucible::session::{self, SessionState};

/// Executor that completes every test locally: success unless the test
/// name contains "fail".
struct ScriptedExecutor;

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn execute_tests(&self, tests: &[Test]) -> Vec<TestResult> {
        tests.iter().map(result_for).collect()
    }

    async fn execute_tests_streaming(&self, tests: &[Test], sink: mpsc::Sender<TestResult>) {
        for test in tests {
            let _ = sink.send(result_for(test)).await;
        }
    }
}

fn result_for(test: &Test) -> TestResult {
    let success = !test.name.contains("fail");
    TestResult {
        test_id: test.id.clone(),
        success,
        output: "captured output".to_string(),
        error: if success {
            None
        } else {
            Some("exit code 1".to_string())
        },
        execution_time: Some(0.05),
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn spawn_orchestrator() -> String {
    let config = OrchestratorConfig {
        bind: "127.0.0.1:0".to_string(),
        // Long enough that no ping interferes with the assertions.
        keepalive_interval_s: 300,
        cors_origins: vec!["*".to_string()],
    };

    let executor: Arc<dyn TestExecutor> = Arc::new(ScriptedExecutor);
    let coordinator = GenerationCoordinator::new(default_synthesizers(), Arc::clone(&executor));
    let state = Arc::new(SessionState::new(
        config,
        executor,
        Arc::new(KeyFormatDetector),
        Arc::new(StructuralValidator::new()),
        coordinator,
        Arc::new(TemplateDocGenerator),
        Arc::new(TemplateImprovementGenerator),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, session::router(state)).await.unwrap();
    });

    format!("ws://{addr}/ws")
}

async fn connect(url: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Reads the next non-ping JSON frame.
async fn next_frame(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == "ping" {
                continue;
            }
            return value;
        }
    }
}

#[tokio::test]
async fn generate_tests_streams_snapshots_then_updates() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "a",
            "type": "generate_tests",
            "code": "def add(x, y):\n    return x + y\n",
        }),
    )
    .await;

    // Built-in synthesizers: 2 unit + 1 memory + 1 performance tests.
    // Expect 2 snapshots per kind plus one update per test.
    let mut frames = Vec::new();
    for _ in 0..10 {
        frames.push(next_frame(&mut ws).await);
    }

    // Every frame carries the request id.
    assert!(frames.iter().all(|f| f["id"] == "a"));

    for (response_type, field, count) in [
        ("return_unit_tests", "unit_tests", 2),
        ("return_memory_tests", "memory_tests", 1),
        ("return_performance_tests", "performance_tests", 1),
    ] {
        let snapshots: Vec<_> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f["type"] == response_type)
            .collect();
        assert_eq!(snapshots.len(), 2, "{response_type}");

        let pending = snapshots[0].1[field].as_array().unwrap();
        assert_eq!(pending.len(), count);
        assert!(pending.iter().all(|t| t["status"] == "pending"));

        let running = snapshots[1].1[field].as_array().unwrap();
        assert!(running.iter().all(|t| t["status"] == "running"));

        // Updates for this kind all come after its running snapshot.
        let kind = response_type
            .trim_start_matches("return_")
            .trim_end_matches("_tests");
        let running_pos = snapshots[1].0;
        for (pos, frame) in frames.iter().enumerate() {
            if frame["type"] == "test_result_update"
                && frame["test_result"]["type"] == kind
            {
                assert!(pos > running_pos);
            }
        }
    }

    // Exactly one terminal update per test, unique test ids.
    let mut update_ids = std::collections::HashSet::new();
    for frame in &frames {
        if frame["type"] == "test_result_update" {
            let test = &frame["test_result"];
            assert!(test["status"] == "success" || test["status"] == "failed");
            assert!(update_ids.insert(test["id"].as_str().unwrap().to_string()));
        }
    }
    assert_eq!(update_ids.len(), 4);
}

#[tokio::test]
async fn test_ai_with_unknown_key_yields_single_error() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({ "id": "k1", "type": "test_ai", "ai_api_key": "bogus" }),
    )
    .await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "k1");
    assert!(
        frame["error_message"]
            .as_str()
            .unwrap()
            .contains("not valid")
    );
}

#[tokio::test]
async fn test_ai_detects_model_from_key_format() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({ "id": "k2", "type": "test_ai", "ai_api_key": "sk-ant-api03-x" }),
    )
    .await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "ai_test_result");
    assert_eq!(frame["id"], "k2");
    assert_eq!(frame["is_ok"], true);
    assert_eq!(frame["detected_model"], "sonnet");
}

#[tokio::test]
async fn verify_code_round_trip() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "v1",
            "type": "verify_code",
            "code": "def square(n):\n    return n * n\n",
        }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "verify_code_result");
    assert_eq!(frame["id"], "v1");
    assert_eq!(frame["is_ok"], true);

    send_json(
        &mut ws,
        serde_json::json!({ "id": "v2", "type": "verify_code", "code": "x = 1\n" }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "v2");

    send_json(&mut ws, serde_json::json!({ "id": "v3", "type": "verify_code" })).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error_message"], "No code provided.");
}

#[tokio::test]
async fn run_tests_groups_results_by_kind() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "r1",
            "type": "run_tests",
            "tests": [
                {
                    "id": "t-unit",
                    "type": "unit",
                    "name": "test_fail_case",
                    "title": "Fail Case",
                    "code": "import sys\nsys.exit(1)\n",
                },
                {
                    "id": "t-perf",
                    "type": "performance",
                    "name": "test_ok_case",
                    "title": "Ok Case",
                    "code": "print('ok')\n",
                },
            ],
        }),
    )
    .await;

    let mut unit_frame = None;
    let mut perf_frame = None;
    for _ in 0..2 {
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["id"], "r1");
        match frame["type"].as_str().unwrap() {
            "return_unit_tests" => unit_frame = Some(frame),
            "return_performance_tests" => perf_frame = Some(frame),
            other => panic!("unexpected frame type {other}"),
        }
    }

    let unit_tests = unit_frame.unwrap()["unit_tests"].clone();
    let failed = &unit_tests.as_array().unwrap()[0];
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["execution_success"], false);
    assert!(
        failed["execution_error"]
            .as_str()
            .unwrap()
            .contains("exit code")
    );

    let perf_tests = perf_frame.unwrap()["performance_tests"].clone();
    let passed = &perf_tests.as_array().unwrap()[0];
    assert_eq!(passed["status"], "success");
    assert_eq!(passed["execution_success"], true);
}

#[tokio::test]
async fn run_tests_without_tests_is_an_error() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, serde_json::json!({ "id": "r2", "type": "run_tests", "tests": [] })).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "r2");
    assert_eq!(frame["error_message"], "No tests provided.");
}

#[tokio::test]
async fn generate_docs_and_improvements_require_a_valid_key() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "d1",
            "type": "generate_docs",
            "code": "def add(x, y):\n    return x + y\n",
            "ai_api_key": "invalid",
        }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error_message"], "AI model or API key is invalid.");

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "d2",
            "type": "generate_docs",
            "code": "def add(x, y):\n    return x + y\n",
            "ai_api_key": "sk-ant-api03-x",
        }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "return_docs");
    assert_eq!(frame["id"], "d2");
    assert!(frame["docs"].as_str().unwrap().contains("add(x, y)"));

    send_json(
        &mut ws,
        serde_json::json!({
            "id": "i1",
            "type": "generate_improvements",
            "code": "def add(x, y):\n    return x + y\n",
            "ai_api_key": "AIzaFakeKey",
        }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "return_improvements");
    assert!(!frame["improvements"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_frames_keep_the_session_alive() {
    let url = spawn_orchestrator().await;
    let mut ws = connect(&url).await;

    // Invalid JSON: error response with the id key omitted entirely.
    send_json_raw(&mut ws, "this is not json").await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert!(
        frame.get("id").is_none(),
        "uncorrelated error must omit the id key"
    );

    // Valid JSON, bad envelope: id is salvaged.
    send_json(&mut ws, serde_json::json!({ "id": "m1", "type": "generate_tests", "code": 42 }))
        .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "m1");

    // Valid JSON, bad envelope, nothing to salvage: uncorrelated again.
    send_json(&mut ws, serde_json::json!({ "type": "generate_tests", "code": 42 })).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert!(frame.get("id").is_none());

    // Unknown type: no response at all. Prove it by following with a
    // request that does respond and checking which answer arrives.
    send_json(&mut ws, serde_json::json!({ "id": "u1", "type": "no_such_type" })).await;
    send_json(
        &mut ws,
        serde_json::json!({ "id": "after", "type": "verify_code", "code": "def f():\n    pass\n" }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["id"], "after");
    assert_eq!(frame["type"], "verify_code_result");
}

async fn send_json_raw(ws: &mut WsClient, raw: &str) {
    ws.send(Message::Text(raw.to_string().into())).await.unwrap();
}

#[tokio::test]
async fn concurrent_sessions_never_observe_each_other() {
    let url = spawn_orchestrator().await;
    let mut ws_a = connect(&url).await;
    let mut ws_b = connect(&url).await;

    let code = "def add(x, y):\n    return x + y\n";
    send_json(&mut ws_a, serde_json::json!({ "id": "a", "type": "generate_tests", "code": code }))
        .await;
    send_json(&mut ws_b, serde_json::json!({ "id": "b", "type": "generate_tests", "code": code }))
        .await;

    let mut ids_a = std::collections::HashSet::new();
    let mut ids_b = std::collections::HashSet::new();

    for _ in 0..10 {
        let frame = next_frame(&mut ws_a).await;
        assert_eq!(frame["id"], "a");
        collect_test_ids(&frame, &mut ids_a);
    }
    for _ in 0..10 {
        let frame = next_frame(&mut ws_b).await;
        assert_eq!(frame["id"], "b");
        collect_test_ids(&frame, &mut ids_b);
    }

    assert!(!ids_a.is_empty());
    assert!(!ids_b.is_empty());
    assert!(ids_a.is_disjoint(&ids_b), "test ids leaked across sessions");
}

fn collect_test_ids(frame: &serde_json::Value, into: &mut std::collections::HashSet<String>) {
    for field in ["unit_tests", "memory_tests", "performance_tests"] {
        if let Some(tests) = frame[field].as_array() {
            for test in tests {
                into.insert(test["id"].as_str().unwrap().to_string());
            }
        }
    }
    if let Some(test) = frame.get("test_result")
        && let Some(id) = test["id"].as_str()
    {
        into.insert(id.to_string());
    }
}
