//! # crucible
//!
//! A streaming test-execution orchestrator. Crucible accepts an untrusted
//! user-supplied function over a WebSocket session, synthesizes a battery
//! of tests for it (unit, memory, performance), executes each test in an
//! ephemeral resource-capped sandbox, and streams per-test results back to
//! the client as they complete.
//!
//! ## Architecture
//!
//! The crate hosts two planes that deploy as separate processes:
//!
//! ### Orchestrator plane
//!
//! - [`session`] - Per-client session controller on the WebSocket channel:
//!   request routing, a single serialized writer per session, keepalives,
//!   and cancellation of in-flight work on disconnect.
//! - [`generate`] - Test-generation coordinator: runs the three test kinds
//!   concurrently, emitting `pending`/`running` snapshots and one
//!   `test_result_update` per completed test.
//! - [`link`] - Client for the runner service link, with bounded
//!   exponential backoff and per-dispatch correlation ids. Fatal link
//!   errors become synthesized per-test failures, never dropped entries.
//! - [`external`] - Collaborator interfaces (source validator, model
//!   detector, test synthesizers, doc/improvement generators) and their
//!   built-in implementations.
//!
//! ### Runner plane
//!
//! - [`runner`] - The sandbox-facing WebSocket service that accepts
//!   dispatches.
//! - [`dispatch`] - Fan-out/fan-in of N tests onto N concurrent sandbox
//!   executions, bounded by a parallelism cap.
//! - [`sandbox`] - Sandbox backends behind one trait:
//!   [`sandbox::docker::DockerBackend`] (one ephemeral container per test)
//!   and [`sandbox::kubernetes::KubernetesBackend`] (one Job+ConfigMap per
//!   test). Both guarantee cleanup on every exit path.
//!
//! ### Shared
//!
//! - [`protocol`] - Typed request/response envelopes for the client
//!   channel and the runner link, with correlation-id rules.
//! - [`config`] - TOML configuration with defaults for every knob.
//!
//! ## Delivery guarantees
//!
//! For every dispatched test exactly one terminal result reaches the
//! client, even under sandbox failure, link failure, or timeout. Test
//! status moves strictly along `pending -> running -> (success | failed)`.
//! Frames on a single session are totally ordered.

pub mod config;
pub mod dispatch;
pub mod external;
pub mod generate;
pub mod link;
pub mod protocol;
pub mod runner;
pub mod sandbox;
pub mod session;

// Re-export the types most embedders need.

pub use config::{Config, load_config};
pub use dispatch::Dispatcher;
pub use generate::GenerationCoordinator;
pub use link::{RunnerClient, TestExecutor};
pub use protocol::{Test, TestKind, TestStatus};
pub use sandbox::SandboxBackend;
pub use session::{SessionState, SessionWriter};
