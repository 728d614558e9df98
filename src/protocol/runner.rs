//! Wire protocol for the orchestrator <-> runner service link.
//!
//! The runner link uses its own correlation id (`message_id`, allocated by
//! the orchestrator per dispatch) which is independent from the client
//! correlation id. Frames are JSON and discriminated by shape: a reply
//! either carries `results` (batched), `test_result` (streamed), `error`,
//! or a `type` of `ping`/`pong`.

use serde::{Deserialize, Serialize};

use super::{Test, TestKind};

/// One test as shipped to the runner service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub name: String,
    pub title: String,
    pub code: String,
}

impl From<&Test> for TestSpec {
    fn from(test: &Test) -> Self {
        Self {
            id: test.id.clone(),
            kind: test.kind,
            name: test.name.clone(),
            title: test.title.clone(),
            code: test.source.clone(),
        }
    }
}

/// A dispatch request: one batch of tests under one `message_id`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerRequest {
    pub message_id: String,
    #[serde(default)]
    pub streaming: bool,
    pub tests: Vec<TestSpec>,
}

impl RunnerRequest {
    /// Builds a request with a fresh orchestrator-side correlation id.
    pub fn new(tests: &[Test], streaming: bool) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            streaming,
            tests: tests.iter().map(TestSpec::from).collect(),
        }
    }
}

/// Outcome of executing one test in a sandbox.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestResult {
    pub test_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

impl TestResult {
    /// A failure synthesized outside the sandbox (infrastructure trouble,
    /// link errors, cancellation). Keeps invariant "one terminal result
    /// per dispatched test" intact.
    pub fn infra_failure(test_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            execution_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Ping,
    Pong,
}

/// Any frame the runner service may send back.
///
/// Decoded by shape; variant order matters for `untagged` (a control frame
/// is the only one with a `type` key, an error frame the only one with
/// `error`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RunnerReply {
    Control {
        #[serde(rename = "type")]
        kind: ControlKind,
        #[serde(default)]
        message_id: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Single {
        message_id: String,
        test_result: TestResult,
    },
    Batch {
        message_id: String,
        results: Vec<TestResult>,
    },
}

/// Any frame the runner service may receive.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunnerInbound {
    Control {
        #[serde(rename = "type")]
        kind: ControlKind,
        #[serde(default)]
        message_id: String,
    },
    Request(RunnerRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_assigns_fresh_message_ids() {
        let tests = vec![Test::new(TestKind::Unit, "t", "T", "code")];
        let a = RunnerRequest::new(&tests, true);
        let b = RunnerRequest::new(&tests, true);
        assert_ne!(a.message_id, b.message_id);
        assert!(a.streaming);
        assert_eq!(a.tests.len(), 1);
        assert_eq!(a.tests[0].id, tests[0].id);
    }

    #[test]
    fn spec_uses_wire_field_names() {
        let test = Test::new(TestKind::Performance, "test_perf", "Perf", "print(1)");
        let spec = TestSpec::from(&test);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""type":"performance""#));
        assert!(json.contains(r#""code":"print(1)""#));
    }

    #[test]
    fn reply_decodes_batch_frame() {
        let raw = r#"{"message_id": "m1", "results": [
            {"test_id": "t1", "success": true, "output": "ok"}
        ]}"#;
        match serde_json::from_str::<RunnerReply>(raw).unwrap() {
            RunnerReply::Batch { message_id, results } => {
                assert_eq!(message_id, "m1");
                assert_eq!(results.len(), 1);
                assert!(results[0].success);
                assert!(results[0].error.is_none());
            }
            other => panic!("expected batch frame, got {other:?}"),
        }
    }

    #[test]
    fn reply_decodes_single_frame() {
        let raw = r#"{"message_id": "m2", "test_result":
            {"test_id": "t9", "success": false, "output": "", "error": "timeout"}
        }"#;
        match serde_json::from_str::<RunnerReply>(raw).unwrap() {
            RunnerReply::Single { message_id, test_result } => {
                assert_eq!(message_id, "m2");
                assert_eq!(test_result.error.as_deref(), Some("timeout"));
            }
            other => panic!("expected single frame, got {other:?}"),
        }
    }

    #[test]
    fn reply_decodes_control_and_error_frames() {
        match serde_json::from_str::<RunnerReply>(r#"{"type": "pong", "message_id": "m"}"#).unwrap()
        {
            RunnerReply::Control { kind, .. } => assert_eq!(kind, ControlKind::Pong),
            other => panic!("expected control frame, got {other:?}"),
        }

        match serde_json::from_str::<RunnerReply>(r#"{"error": "Invalid JSON format"}"#).unwrap() {
            RunnerReply::Error { error, details } => {
                assert_eq!(error, "Invalid JSON format");
                assert!(details.is_none());
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn inbound_distinguishes_ping_from_request() {
        match serde_json::from_str::<RunnerInbound>(r#"{"type": "ping", "message_id": "x"}"#)
            .unwrap()
        {
            RunnerInbound::Control { kind, .. } => assert_eq!(kind, ControlKind::Ping),
            other => panic!("expected control, got {other:?}"),
        }

        let raw = r#"{"message_id": "m3", "streaming": true, "tests": []}"#;
        match serde_json::from_str::<RunnerInbound>(raw).unwrap() {
            RunnerInbound::Request(req) => {
                assert_eq!(req.message_id, "m3");
                assert!(req.tests.is_empty());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }
}
