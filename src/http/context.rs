//! Request context and the onion-model handler chain.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, request};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::ContextError;
use crate::cache::CacheEngine;
use crate::engine::{Engines, PubSubEngine, QueueEngine};

/// One link of a handler chain.
///
/// A handler receives the request context and may call [`Context::next`] to
/// run the rest of the chain; code placed after that call runs once the
/// downstream handlers have returned.
pub type Handler = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
///
/// ```ignore
/// let hello = handler(|c| Box::pin(async move {
///     c.text(StatusCode::OK, "hello");
/// }));
/// ```
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// Per-request state threaded through a handler chain.
///
/// Contexts are pooled: every field is cleared when the context is handed
/// out and again when it is returned, so nothing of one request is visible
/// to the next.
pub struct Context {
    handlers: Arc<[Handler]>,
    cursor: usize,
    aborted: bool,

    method: Method,
    path: String,
    route_path: Arc<str>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
    params: HashMap<String, String>,
    values: HashMap<String, Value>,

    status: Option<StatusCode>,
    response_headers: HeaderMap,
    response_body: BytesMut,

    engines: Engines,
}

impl Context {
    pub fn new() -> Self {
        Self {
            handlers: Arc::from(Vec::new()),
            cursor: 0,
            aborted: false,
            method: Method::GET,
            path: String::new(),
            route_path: Arc::from(""),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: HashMap::new(),
            values: HashMap::new(),
            status: None,
            response_headers: HeaderMap::new(),
            response_body: BytesMut::new(),
            engines: Engines::default(),
        }
    }

    /// Bind a chain, its engines and the matched route pattern.
    pub(crate) fn prepare(&mut self, handlers: Arc<[Handler]>, engines: Engines, route_path: Arc<str>) {
        self.handlers = handlers;
        self.cursor = 0;
        self.aborted = false;
        self.engines = engines;
        self.route_path = route_path;
    }

    pub(crate) fn load_request(
        &mut self,
        parts: request::Parts,
        body: Bytes,
        params: HashMap<String, String>,
    ) {
        self.method = parts.method;
        self.path.push_str(parts.uri.path());
        if let Ok(Query(pairs)) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
            for (name, value) in pairs {
                self.query.entry(name).or_insert(value);
            }
        }
        self.headers = parts.headers;
        self.body = body;
        self.params.extend(params);
    }

    /// Clear every request and response field, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.handlers = Arc::from(Vec::new());
        self.cursor = 0;
        self.aborted = false;
        self.method = Method::GET;
        self.path.clear();
        self.route_path = Arc::from("");
        self.query.clear();
        self.headers.clear();
        self.body = Bytes::new();
        self.params.clear();
        self.values.clear();
        self.reset_response();
        self.engines = Engines::default();
    }

    /// Run the remaining handlers in order until the chain ends or is aborted.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while self.cursor < self.handlers.len() && !self.aborted {
                let handler = Arc::clone(&self.handlers[self.cursor]);
                self.cursor += 1;
                handler(&mut *self).await;
            }
        })
    }

    /// Stop the chain: handlers not yet started are skipped.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn abort_with_status(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Concrete request path, e.g. `/users/42`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registered route pattern, e.g. `/users/:id`.
    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// First value of a query-string parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn queries(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn set_session(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn session(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove_session(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self
    }

    /// Status set so far; `None` is sent as 200.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.response_headers.insert(name, value);
        self
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Response content type, if one was set.
    pub fn content_type(&self) -> Option<&str> {
        self.response_headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                self.response_headers.insert(header::CONTENT_TYPE, value);
            }
            Err(err) => warn!(content_type, error = %err, "invalid content type ignored"),
        }
        self
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    pub fn set_body(&mut self, body: impl AsRef<[u8]>) -> &mut Self {
        self.response_body.clear();
        self.response_body.extend_from_slice(body.as_ref());
        self
    }

    /// Append to the response body.
    pub fn write(&mut self, chunk: impl AsRef<[u8]>) -> &mut Self {
        self.response_body.extend_from_slice(chunk.as_ref());
        self
    }

    /// Drop any status, headers and body written so far.
    pub fn reset_response(&mut self) {
        self.status = None;
        self.response_headers.clear();
        self.response_body.clear();
    }

    /// Serialize `value` as the JSON response body.
    ///
    /// A value that fails to serialize produces a 500 and is logged.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.status(status).set_content_type(APPLICATION_JSON).set_body(bytes);
            }
            Err(err) => {
                error!(path = %self.path, error = %err, "failed to encode JSON response");
                self.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .set_content_type(TEXT_PLAIN)
                    .set_body("Internal Server Error");
            }
        }
    }

    pub fn text(&mut self, status: StatusCode, body: impl AsRef<str>) {
        self.status(status)
            .set_content_type(TEXT_PLAIN)
            .set_body(body.as_ref());
    }

    /// Write a plain-text body, leaving the status as it is.
    pub fn send_string(&mut self, body: impl AsRef<str>) {
        if self.content_type().is_none() {
            self.set_content_type(TEXT_PLAIN);
        }
        self.set_body(body.as_ref());
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    pub fn cache(&self) -> Result<&Arc<CacheEngine>, ContextError> {
        self.engines
            .cache
            .as_ref()
            .ok_or(ContextError::EngineMissing("cache"))
    }

    pub fn pubsub(&self) -> Result<&PubSubEngine, ContextError> {
        self.engines
            .pubsub
            .as_ref()
            .ok_or(ContextError::EngineMissing("pubsub"))
    }

    pub fn queue(&self) -> Result<&QueueEngine, ContextError> {
        self.engines
            .queue
            .as_ref()
            .ok_or(ContextError::EngineMissing("queue"))
    }

    /// Run `task` in the background, detached from the response.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task)
    }

    /// Run every task concurrently and wait for all of them.
    ///
    /// A task that panics is logged; the others still run to completion.
    pub fn parallel<I, F>(&self, tasks: I) -> BoxFuture<'static, ()>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()> + Send + 'static,
    {
        let handles: Vec<JoinHandle<()>> = tasks.into_iter().map(tokio::spawn).collect();
        Box::pin(async move {
            for outcome in join_all(handles).await {
                if let Err(err) = outcome {
                    error!(error = %err, "parallel task failed");
                }
            }
        })
    }

    /// Move the response out, leaving the response fields empty. The body
    /// buffer keeps its capacity for the next pooled request.
    pub(crate) fn take_response(&mut self) -> Response {
        let body = Bytes::copy_from_slice(&self.response_body);
        self.response_body.clear();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = self.status.take().unwrap_or(StatusCode::OK);
        *response.headers_mut() = std::mem::take(&mut self.response_headers);
        response
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
