//! Bridge between axum requests and handler chains.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use serde_json::json;
use tracing::{error, warn};

use super::{ContextPool, Handler};
use crate::engine::Engines;
use crate::util::panic::panic_message;

/// Everything one registered method+path needs to serve a request.
pub(crate) struct Endpoint {
    pub(crate) chain: Arc<[Handler]>,
    pub(crate) engines: Engines,
    pub(crate) pool: Arc<ContextPool>,
    pub(crate) route_path: Arc<str>,
    pub(crate) body_limit: usize,
}

pub(crate) async fn dispatch(
    endpoint: Arc<Endpoint>,
    params: HashMap<String, String>,
    request: Request,
) -> Response {
    let (parts, request_body) = request.into_parts();
    let request_body = match body::to_bytes(request_body, endpoint.body_limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(
                path = %parts.uri.path(),
                limit = endpoint.body_limit,
                error = %err,
                "failed to read request body"
            );
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut context = endpoint.pool.acquire();
    context.prepare(
        Arc::clone(&endpoint.chain),
        endpoint.engines.clone(),
        Arc::clone(&endpoint.route_path),
    );
    context.load_request(parts, request_body, params);

    let outcome = AssertUnwindSafe(context.next()).catch_unwind().await;
    if let Err(panic) = outcome {
        error!(
            method = %context.method(),
            path = context.path(),
            panic = %panic_message(panic.as_ref()),
            "handler panicked"
        );
        context.reset_response();
        context.json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "error": "Internal Server Error" }),
        );
    }

    let response = context.take_response();
    endpoint.pool.release(context);
    response
}
