//! Wire protocol types for the client channel.
//!
//! Every frame on the client channel is a self-describing JSON object with
//! an `id` (client correlation id) and a `type`. Responses echo the `id` of
//! the request that caused them; the only frame without a correlation id is
//! the keepalive [`PingMessage`].
//!
//! Unknown fields on inbound frames are ignored. Outbound frames never
//! carry fields that are not set (`Option` fields are skipped when `None`).

pub mod runner;

use serde::{Deserialize, Serialize};

/// Category of a synthesized or user-provided test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Unit,
    Memory,
    Performance,
}

impl TestKind {
    /// All kinds, in the order generation runs them.
    pub const ALL: [TestKind; 3] = [TestKind::Unit, TestKind::Memory, TestKind::Performance];

    /// The response type that carries a list of tests of this kind.
    pub fn response_kind(self) -> ResponseKind {
        match self {
            TestKind::Unit => ResponseKind::ReturnUnitTests,
            TestKind::Memory => ResponseKind::ReturnMemoryTests,
            TestKind::Performance => ResponseKind::ReturnPerformanceTests,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::Unit => "unit",
            TestKind::Memory => "memory",
            TestKind::Performance => "performance",
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a test.
///
/// Transitions are strictly monotone along
/// `pending -> running -> (success | failed)`. [`Test::advance`] rejects
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Success | TestStatus::Failed)
    }

    /// Whether moving from `self` to `next` follows the monotone chain.
    pub fn can_advance_to(self, next: TestStatus) -> bool {
        matches!(
            (self, next),
            (TestStatus::Pending, TestStatus::Running)
                | (TestStatus::Running, TestStatus::Success)
                | (TestStatus::Running, TestStatus::Failed)
        )
    }
}

/// AI model families the orchestrator knows how to talk about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AiModel {
    Sonnet,
    Gemini,
}

/// A single test: identity, opaque source, status, and (once terminal)
/// the execution record.
///
/// The `source` field is an opaque blob of code in the sandbox language.
/// The orchestrator never parses or rewrites it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Test {
    #[serde(default = "new_test_id")]
    pub id: String,

    #[serde(rename = "type")]
    pub kind: TestKind,

    pub name: String,
    pub title: String,

    #[serde(rename = "code")]
    pub source: String,

    #[serde(default = "default_status")]
    pub status: TestStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

fn new_test_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_status() -> TestStatus {
    TestStatus::Pending
}

impl Test {
    /// Creates a pending test with a fresh id.
    pub fn new(
        kind: TestKind,
        name: impl Into<String>,
        title: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: new_test_id(),
            kind,
            name: name.into(),
            title: title.into(),
            source: source.into(),
            status: TestStatus::Pending,
            execution_success: None,
            execution_output: None,
            execution_error: None,
            execution_time: None,
        }
    }

    /// Advances the status along the monotone chain.
    ///
    /// Returns `false` (and leaves the test untouched) if the transition
    /// would regress or skip a step. Callers log that as a bug; it is not
    /// a panic.
    pub fn advance(&mut self, next: TestStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Populates the execution record and moves the test to its terminal
    /// status. Called exactly once per test.
    pub fn record_result(&mut self, result: &runner::TestResult) {
        self.execution_success = Some(result.success);
        self.execution_output = Some(result.output.clone());
        self.execution_error = result.error.clone();
        self.execution_time = result.execution_time;

        let terminal = if result.success {
            TestStatus::Success
        } else {
            TestStatus::Failed
        };
        if !self.advance(terminal) {
            tracing::error!(
                test_id = %self.id,
                from = ?self.status,
                to = ?terminal,
                "refusing non-monotone status transition"
            );
        }
    }
}

/// Request types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TestAi,
    VerifyCode,
    GenerateTests,
    GenerateDocs,
    GenerateImprovements,
    RunTests,
    Pong,
}

/// A parsed client request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: RequestKind,

    pub code: Option<String>,
    pub language: Option<String>,
    pub ai_model: Option<AiModel>,
    pub ai_api_key: Option<String>,
    pub tests: Option<Vec<Test>>,
}

/// Response types the orchestrator emits (keepalive pings excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Error,
    ReturnUnitTests,
    ReturnMemoryTests,
    ReturnPerformanceTests,
    ReturnDocs,
    ReturnImprovements,
    AiTestResult,
    VerifyCodeResult,
    TestResultUpdate,
}

/// A response envelope. Carries the correlation id of the request it
/// belongs to; the id is absent only on `error` responses to frames whose
/// id could not be read.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub kind: ResponseKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_tests: Option<Vec<Test>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_tests: Option<Vec<Test>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_tests: Option<Vec<Test>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvements: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_ok: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_model: Option<AiModel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<Test>,
}

impl ResponseMessage {
    fn bare(id: Option<String>, kind: ResponseKind) -> Self {
        Self {
            id,
            kind,
            error_message: None,
            unit_tests: None,
            memory_tests: None,
            performance_tests: None,
            docs: None,
            improvements: None,
            is_ok: None,
            detected_model: None,
            test_result: None,
        }
    }

    /// An `error` response. Pass `None` when the offending frame's id was
    /// unreadable; the `id` key is then omitted from the wire frame.
    pub fn error(id: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        let mut msg = Self::bare(id.into(), ResponseKind::Error);
        msg.error_message = Some(message.into());
        msg
    }

    /// A `return_<kind>_tests` frame carrying a full test list.
    pub fn kind_tests(id: impl Into<String>, kind: TestKind, tests: Vec<Test>) -> Self {
        let mut msg = Self::bare(Some(id.into()), kind.response_kind());
        match kind {
            TestKind::Unit => msg.unit_tests = Some(tests),
            TestKind::Memory => msg.memory_tests = Some(tests),
            TestKind::Performance => msg.performance_tests = Some(tests),
        }
        msg
    }

    /// A `test_result_update` frame carrying one completed test. The id is
    /// the originating `generate_tests` request id.
    pub fn result_update(id: impl Into<String>, test: Test) -> Self {
        let mut msg = Self::bare(Some(id.into()), ResponseKind::TestResultUpdate);
        msg.test_result = Some(test);
        msg
    }

    pub fn ai_ok(id: impl Into<String>, model: AiModel) -> Self {
        let mut msg = Self::bare(Some(id.into()), ResponseKind::AiTestResult);
        msg.is_ok = Some(true);
        msg.detected_model = Some(model);
        msg
    }

    pub fn verify_ok(id: impl Into<String>) -> Self {
        let mut msg = Self::bare(Some(id.into()), ResponseKind::VerifyCodeResult);
        msg.is_ok = Some(true);
        msg
    }

    pub fn docs(id: impl Into<String>, docs: String) -> Self {
        let mut msg = Self::bare(Some(id.into()), ResponseKind::ReturnDocs);
        msg.docs = Some(docs);
        msg
    }

    pub fn improvements(id: impl Into<String>, improvements: Vec<String>) -> Self {
        let mut msg = Self::bare(Some(id.into()), ResponseKind::ReturnImprovements);
        msg.improvements = Some(improvements);
        msg
    }
}

/// Keepalive frame. Carries a timestamp and no correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct PingMessage {
    #[serde(rename = "type")]
    kind: PingKind,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum PingKind {
    Ping,
}

impl PingMessage {
    pub fn now() -> Self {
        Self {
            kind: PingKind::Ping,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Anything the session writer can put on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(ResponseMessage),
    Ping(PingMessage),
}

impl From<ResponseMessage> for Outbound {
    fn from(msg: ResponseMessage) -> Self {
        Outbound::Response(msg)
    }
}

/// Best-effort extraction of a correlation id from a frame that failed
/// envelope validation, so the error response can still be correlated.
pub fn salvage_request_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("id")?.as_str().map(str::to_owned)
}
