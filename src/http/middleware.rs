//! Built-in chain handlers.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use futures::FutureExt;
use metrics::histogram;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Handler, handler};
use crate::util::panic::panic_message;

pub(crate) const METRIC_HTTP_REQUEST_MS: &str = "turbine_http_request_ms";

pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Session key under which [`request_id`] stores the id.
pub const REQUEST_ID_KEY: &str = "request_id";

const ACCESS_TARGET: &str = "turbine::http::access";

/// Log each request once the rest of the chain has finished.
///
/// Server errors log at `error`, client errors at `warn`, the rest at `info`.
pub fn access_log() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let started = Instant::now();
            c.next().await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            histogram!(METRIC_HTTP_REQUEST_MS).record(elapsed_ms);

            let status = c.response_status().unwrap_or(StatusCode::OK).as_u16();
            let method = c.method().as_str();
            let path = c.path();
            let request_id = c
                .session(REQUEST_ID_KEY)
                .and_then(Value::as_str)
                .unwrap_or("-");
            if status >= 500 {
                error!(target: ACCESS_TARGET, status, method, path, request_id, elapsed_ms, "request failed");
            } else if status >= 400 {
                warn!(target: ACCESS_TARGET, status, method, path, request_id, elapsed_ms, "request rejected");
            } else {
                info!(target: ACCESS_TARGET, status, method, path, request_id, elapsed_ms, "request served");
            }
        })
    })
}

/// Turn a panic anywhere below into a 500 JSON response and abort the chain.
pub fn recover() -> Handler {
    handler(|c| {
        Box::pin(async move {
            if let Err(panic) = AssertUnwindSafe(c.next()).catch_unwind().await {
                error!(
                    method = %c.method(),
                    path = c.path(),
                    panic = %panic_message(panic.as_ref()),
                    "recovered from handler panic"
                );
                c.reset_response();
                c.json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &json!({ "error": "Internal Server Error" }),
                );
                c.abort();
            }
        })
    })
}

/// Tag each request with an id, reusing a valid incoming `x-request-id`.
pub fn request_id() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let id = c
                .header(REQUEST_ID_HEADER)
                .filter(|id| !id.is_empty() && id.len() <= 128)
                .map(str::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if let Ok(value) = HeaderValue::from_str(&id) {
                c.set_header(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            c.set_session(REQUEST_ID_KEY, id);
            c.next().await;
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, Request};
    use bytes::Bytes;

    use super::*;
    use crate::engine::Engines;
    use crate::http::Context;

    async fn run(chain: Vec<Handler>) -> Context {
        let mut c = Context::new();
        c.prepare(chain.into(), Engines::default(), Arc::from("/"));
        c.next().await;
        c
    }

    #[tokio::test]
    async fn recover_turns_panic_into_500() {
        let boom = handler(|c| {
            Box::pin(async move {
                c.text(StatusCode::OK, "partial");
                panic!("boom");
            })
        });

        let c = run(vec![recover(), boom]).await;
        assert!(c.is_aborted());
        assert_eq!(c.response_status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(
            c.response_body(),
            br#"{"error":"Internal Server Error"}"#
        );
    }

    #[tokio::test]
    async fn request_id_is_generated_and_exposed() {
        let probe = handler(|c| {
            Box::pin(async move {
                let id = c
                    .session(REQUEST_ID_KEY)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                c.send_string(id);
            })
        });

        let c = run(vec![request_id(), probe]).await;
        let header = c
            .response_headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .expect("header");
        assert!(Uuid::parse_str(header).is_ok());
        assert_eq!(c.response_body(), header.as_bytes());
    }

    #[tokio::test]
    async fn request_id_reuses_incoming_header() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(())
            .expect("request");
        let (parts, ()) = request.into_parts();

        let mut c = Context::new();
        c.prepare(vec![request_id()].into(), Engines::default(), Arc::from("/"));
        c.load_request(parts, Bytes::new(), Default::default());
        c.next().await;

        assert_eq!(c.session(REQUEST_ID_KEY), Some(&json!("abc-123")));
    }

    #[tokio::test]
    async fn access_log_passes_through() {
        let route = handler(|c| {
            Box::pin(async move {
                c.text(StatusCode::NOT_FOUND, "nope");
            })
        });

        let c = run(vec![access_log(), route]).await;
        assert_eq!(c.response_status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(c.response_body(), b"nope");
    }
}
