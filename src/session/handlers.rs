//! Request handlers for the session controller.
//!
//! Each handler owns one request type end to end: validate the payload,
//! call the relevant collaborator or dispatch path, and emit the response
//! frames. Failures are reported on the session as `error` responses; the
//! session itself always continues.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::external::FunctionInfo;
use crate::protocol::{RequestMessage, ResponseMessage, Test, TestKind, TestStatus};
use crate::session::SessionContext;

pub(crate) async fn handle_test_ai(ctx: &SessionContext, request: RequestMessage) {
    let Some(api_key) = request.ai_api_key.filter(|k| !k.is_empty()) else {
        ctx.writer
            .send(ResponseMessage::error(
                request.id,
                "API key not provided in the message.",
            ))
            .await;
        return;
    };

    match ctx.state.detector.detect_model(&api_key).await {
        Some(model) => {
            info!(model = ?model, "detected AI model for client key");
            ctx.writer.send(ResponseMessage::ai_ok(request.id, model)).await;
        }
        None => {
            ctx.writer
                .send(ResponseMessage::error(
                    request.id,
                    "API key is not valid for any supported AI service.",
                ))
                .await;
        }
    }
}

pub(crate) async fn handle_verify_code(ctx: &SessionContext, request: RequestMessage) {
    let Some(code) = request.code.filter(|c| !c.is_empty()) else {
        ctx.writer
            .send(ResponseMessage::error(request.id, "No code provided."))
            .await;
        return;
    };

    match ctx.state.validator.validate(&code) {
        Ok(_) => ctx.writer.send(ResponseMessage::verify_ok(request.id)).await,
        Err(reason) => {
            debug!(reason = %reason, "code verification rejected");
            ctx.writer
                .send(ResponseMessage::error(request.id, "Invalid code format."))
                .await;
        }
    }
}

pub(crate) async fn handle_generate_tests(ctx: &SessionContext, request: RequestMessage) {
    let Some((function, code, _)) = validated_request(ctx, &request, false).await else {
        return;
    };

    ctx.state
        .coordinator
        .generate_all(
            &request.id,
            &function,
            &code,
            ctx.writer.clone(),
            ctx.cancel.clone(),
        )
        .await;
}

pub(crate) async fn handle_generate_docs(ctx: &SessionContext, request: RequestMessage) {
    let Some((function, code, api_key)) = validated_request(ctx, &request, true).await else {
        return;
    };
    let api_key = api_key.unwrap_or_default();

    match ctx.state.docs.generate(&function, &api_key, &code).await {
        Ok(docs) => ctx.writer.send(ResponseMessage::docs(request.id, docs)).await,
        Err(e) => {
            ctx.writer
                .send(ResponseMessage::error(
                    request.id,
                    format!("Failed to generate docs: {e}"),
                ))
                .await;
        }
    }
}

pub(crate) async fn handle_generate_improvements(ctx: &SessionContext, request: RequestMessage) {
    let Some((function, code, api_key)) = validated_request(ctx, &request, true).await else {
        return;
    };
    let api_key = api_key.unwrap_or_default();

    match ctx
        .state
        .improvements
        .generate(&function, &api_key, &code)
        .await
    {
        Ok(improvements) => {
            ctx.writer
                .send(ResponseMessage::improvements(request.id, improvements))
                .await;
        }
        Err(e) => {
            ctx.writer
                .send(ResponseMessage::error(
                    request.id,
                    format!("Failed to generate improvements: {e}"),
                ))
                .await;
        }
    }
}

/// Runs client-provided tests in batched mode and returns the results
/// grouped by kind, one `return_<kind>_tests` frame per non-empty group.
pub(crate) async fn handle_run_tests(ctx: &SessionContext, request: RequestMessage) {
    let request_id = request.id;
    let Some(mut tests) = request.tests.filter(|t| !t.is_empty()) else {
        ctx.writer
            .send(ResponseMessage::error(request_id, "No tests provided."))
            .await;
        return;
    };

    info!(count = tests.len(), id = %request_id, "running client-provided tests");

    // Client-provided records may carry any status; their lifecycle on
    // this session starts fresh.
    for test in &mut tests {
        test.status = TestStatus::Pending;
        test.advance(TestStatus::Running);
    }

    let results = ctx.state.executor.execute_tests(&tests).await;
    let mut by_id: HashMap<String, _> = results
        .into_iter()
        .map(|r| (r.test_id.clone(), r))
        .collect();

    for test in &mut tests {
        match by_id.remove(&test.id) {
            Some(result) => test.record_result(&result),
            None => warn!(test_id = %test.id, "no result for dispatched test"),
        }
    }

    for kind in TestKind::ALL {
        let group: Vec<Test> = tests.iter().filter(|t| t.kind == kind).cloned().collect();
        if !group.is_empty() {
            ctx.writer
                .send(ResponseMessage::kind_tests(&request_id, kind, group))
                .await;
        }
    }

    info!(id = %request_id, "completed test execution");
}

/// Shared validation path: code must be present and pass the source
/// validator; with `require_ai`, the key must map to a usable model.
/// Emits the appropriate `error` response and returns `None` on failure.
async fn validated_request(
    ctx: &SessionContext,
    request: &RequestMessage,
    require_ai: bool,
) -> Option<(FunctionInfo, String, Option<String>)> {
    let Some(code) = request.code.clone().filter(|c| !c.is_empty()) else {
        ctx.writer
            .send(ResponseMessage::error(request.id.clone(), "No code provided."))
            .await;
        return None;
    };

    let function = match ctx.state.validator.validate(&code) {
        Ok(function) => function,
        Err(reason) => {
            debug!(reason = %reason, "source validation failed");
            ctx.writer
                .send(ResponseMessage::error(request.id.clone(), "Invalid code format."))
                .await;
            return None;
        }
    };

    let api_key = if require_ai {
        let Some(key) = request.ai_api_key.clone().filter(|k| !k.is_empty()) else {
            ctx.writer
                .send(ResponseMessage::error(
                    request.id.clone(),
                    "AI model or API key is invalid.",
                ))
                .await;
            return None;
        };

        let usable = match request.ai_model {
            Some(model) => ctx.state.detector.test_connection(model, &key).await,
            None => ctx.state.detector.detect_model(&key).await.is_some(),
        };
        if !usable {
            ctx.writer
                .send(ResponseMessage::error(
                    request.id.clone(),
                    "AI model or API key is invalid.",
                ))
                .await;
            return None;
        }
        Some(key)
    } else {
        None
    };

    Some((function, code, api_key))
}
