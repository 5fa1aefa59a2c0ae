//! Application: route table, app-wide middleware and the axum router build.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, Request};
use axum::http::Method;
use axum::routing::{MethodFilter, MethodRouter};
use tracing::{debug, info};

use super::Handler;
use super::middleware::access_log;
use super::pool::{ContextPool, DEFAULT_POOL_CAPACITY};
use super::route::{Route, RouteRegistrar};
use super::transport::{self, Endpoint};
use crate::cache::{CacheKey, cache_injection};
use crate::config::Settings;
use crate::engine::Engines;
use crate::error::AppError;

pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Root route registrar.
///
/// Routes and middleware are collected first; [`App::into_router`] then
/// freezes one handler chain per method and path:
/// `[access_log] + app middleware + group middleware + cache injection + handlers`.
pub struct App {
    routes: Vec<Route>,
    middleware: Vec<Handler>,
    engines: Engines,
    access_log: bool,
    pool_capacity: usize,
    body_limit: usize,
}

impl App {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middleware: Vec::new(),
            engines: Engines::default(),
            access_log: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn from_settings(settings: &Settings, engines: Engines) -> Self {
        Self::new()
            .with_engines(engines)
            .access_log(settings.logging.access_log)
            .pool_capacity(settings.context.pool_capacity)
            .body_limit(settings.server.body_limit.get())
    }

    pub fn with_engines(mut self, engines: Engines) -> Self {
        self.engines = engines;
        self
    }

    /// Insert [`access_log`] at the head of every chain.
    pub fn access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    /// Add middleware to every route, including ones registered earlier.
    pub fn use_middleware(&mut self, middleware: Handler) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route(&mut self, method: &Method, path: &str) -> Option<&mut Route> {
        self.routes
            .iter_mut()
            .find(|route| route.path() == path && route.methods().contains(method))
    }

    pub fn route_by_name(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.name() == Some(name))
    }

    /// Validate the route table and build the axum router.
    pub fn into_router(self) -> Result<Router, AppError> {
        let pool = Arc::new(ContextPool::new(self.pool_capacity));
        let mut seen = HashSet::new();
        let mut paths: BTreeMap<String, MethodRouter> = BTreeMap::new();

        for route in &self.routes {
            let axum_path = axum_path(route.path())?;
            for method in route.methods() {
                if !seen.insert((method.clone(), route.path().to_string())) {
                    return Err(AppError::DuplicateRoute {
                        method: method.to_string(),
                        path: route.path().to_string(),
                    });
                }
                let filter = MethodFilter::try_from(method.clone()).map_err(|err| {
                    AppError::route(route.path(), format!("unsupported method {method}: {err}"))
                })?;

                let endpoint = Arc::new(Endpoint {
                    chain: self.chain_for(route, method),
                    engines: self.engines.clone(),
                    pool: Arc::clone(&pool),
                    route_path: Arc::from(route.path()),
                    body_limit: self.body_limit,
                });
                let service = move |params: Result<Path<HashMap<String, String>>, PathRejection>,
                                    request: Request| {
                    let endpoint = Arc::clone(&endpoint);
                    async move {
                        let params = params.map(|Path(params)| params).unwrap_or_default();
                        transport::dispatch(endpoint, params, request).await
                    }
                };

                let methods = paths.remove(&axum_path).unwrap_or_else(MethodRouter::new);
                paths.insert(axum_path.clone(), methods.on(filter, service));
            }
            debug!(path = route.path(), methods = ?route.methods(), "route registered");
        }

        let routes = paths.len();
        let router = paths
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| {
                router.route(&path, methods)
            });
        info!(routes, "router built");
        Ok(router)
    }

    fn chain_for(&self, route: &Route, method: &Method) -> Arc<[Handler]> {
        let mut chain: Vec<Handler> = Vec::with_capacity(
            self.middleware.len() + route.middleware().len() + route.handlers().len() + 2,
        );
        if self.access_log {
            chain.push(access_log());
        }
        chain.extend(self.middleware.iter().cloned());
        chain.extend(route.middleware().iter().cloned());
        if self.engines.cache.is_some() && route.caches(method) {
            chain.push(cache_injection(
                CacheKey::for_route(method, route.path()),
                route.cache_options().ttl,
            ));
        }
        chain.extend(route.handlers().iter().cloned());
        chain.into()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistrar for App {
    fn prefix(&self) -> &str {
        ""
    }

    fn scoped_middleware(&self) -> &[Handler] {
        &[]
    }

    fn push_route(&mut self, route: Route) -> &mut Route {
        let index = self.routes.len();
        self.routes.push(route);
        &mut self.routes[index]
    }
}

/// Translate `/users/:id/*rest` into axum's `/users/{id}/{*rest}`.
fn axum_path(path: &str) -> Result<String, AppError> {
    if !path.starts_with('/') {
        return Err(AppError::route(path, "path must start with '/'"));
    }
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);
    let mut converted = Vec::with_capacity(segments.len());
    for (index, segment) in segments.iter().enumerate() {
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(AppError::route(path, "parameter without a name"));
            }
            converted.push(format!("{{{name}}}"));
        } else if let Some(name) = segment.strip_prefix('*') {
            if index != last {
                return Err(AppError::route(path, "wildcard must be the last segment"));
            }
            let name = if name.is_empty() { "wildcard" } else { name };
            converted.push(format!("{{*{name}}}"));
        } else if segment.contains(['{', '}']) {
            return Err(AppError::route(path, "braces are not allowed in paths"));
        } else {
            converted.push((*segment).to_string());
        }
    }
    Ok(format!("/{}", converted.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler;

    fn noop() -> Handler {
        handler(|_c| Box::pin(async {}))
    }

    #[test]
    fn converts_parameters_and_wildcards() {
        assert_eq!(axum_path("/").expect("root"), "/");
        assert_eq!(axum_path("/users/:id").expect("param"), "/users/{id}");
        assert_eq!(axum_path("/files/*").expect("wildcard"), "/files/{*wildcard}");
        assert_eq!(axum_path("/files/*rest").expect("named"), "/files/{*rest}");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(axum_path("users"), Err(AppError::Route { .. })));
        assert!(matches!(axum_path("/a/:"), Err(AppError::Route { .. })));
        assert!(matches!(axum_path("/a/*/b"), Err(AppError::Route { .. })));
        assert!(matches!(axum_path("/a/{b}"), Err(AppError::Route { .. })));
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let mut app = App::new();
        app.get("/x", [noop()]);
        app.get("/x", [noop()]);
        assert!(matches!(
            app.into_router(),
            Err(AppError::DuplicateRoute { .. })
        ));
    }

    #[test]
    fn routes_are_found_by_method_path_and_name() {
        let mut app = App::new();
        app.get("/x", [noop()]).named("x");
        app.post("/y", [noop()]);

        app.route(&Method::POST, "/y").expect("route").no_cache();
        assert!(app.route(&Method::GET, "/y").is_none());
        assert_eq!(app.route_by_name("x").map(Route::path), Some("/x"));
        assert!(app.route_by_name("y").is_none());
    }

    #[test]
    fn cache_injection_only_for_cacheable_routes() {
        let mut app = App::new().with_engines(Engines {
            cache: Some(Arc::new(crate::cache::CacheEngine::in_memory())),
            ..Engines::default()
        });
        app.get("/cached", [noop()]);
        app.get("/plain", [noop()]).no_cache();

        let cached = app.chain_for(&app.routes()[0], &Method::GET);
        let plain = app.chain_for(&app.routes()[1], &Method::GET);
        assert_eq!(cached.len(), 2);
        assert_eq!(plain.len(), 1);
    }
}
