//! Routes, groups and the registration surface they share.

use std::fmt;
use std::time::Duration;

use axum::http::Method;

use super::Handler;

/// Every method registered by [`RouteRegistrar::all`].
pub const ALL_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
    Method::CONNECT,
    Method::TRACE,
];

/// Per-route response cache options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime of cached responses; `None` uses the engine default.
    pub ttl: Option<Duration>,
    pub disabled: bool,
    /// Cache methods other than GET as well.
    pub forced: bool,
}

/// A registered route: its methods, full path and handler chain.
pub struct Route {
    methods: Vec<Method>,
    path: String,
    name: Option<String>,
    middleware: Vec<Handler>,
    handlers: Vec<Handler>,
    cache: CacheOptions,
}

impl Route {
    pub(crate) fn new(
        methods: Vec<Method>,
        path: String,
        middleware: Vec<Handler>,
        handlers: Vec<Handler>,
    ) -> Self {
        Self {
            methods,
            path,
            name: None,
            middleware,
            handlers,
            cache: CacheOptions::default(),
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cache_options(&self) -> &CacheOptions {
        &self.cache
    }

    /// Never cache this route's responses.
    pub fn no_cache(&mut self) -> &mut Self {
        self.cache.disabled = true;
        self
    }

    /// Cache this route's responses for `ttl`, whatever its methods.
    pub fn cache(&mut self, ttl: Duration) -> &mut Self {
        self.cache = CacheOptions {
            ttl: Some(ttl),
            disabled: false,
            forced: true,
        };
        self
    }

    pub fn named(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn caches(&self, method: &Method) -> bool {
        !self.cache.disabled && (self.cache.forced || *method == Method::GET)
    }

    pub(crate) fn middleware(&self) -> &[Handler] {
        &self.middleware
    }

    pub(crate) fn handlers(&self) -> &[Handler] {
        &self.handlers
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("middleware", &self.middleware.len())
            .field("handlers", &self.handlers.len())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Anything routes can be registered on: the [`App`](super::App) or a
/// [`Group`] nested under it.
///
/// Paths use `:name` for a segment parameter and a trailing `*` or `*name`
/// for the rest of the path.
pub trait RouteRegistrar {
    /// Path prefix applied to routes registered here.
    fn prefix(&self) -> &str;

    /// Middleware copied into routes registered here, ahead of their handlers.
    fn scoped_middleware(&self) -> &[Handler];

    fn push_route(&mut self, route: Route) -> &mut Route;

    fn add<I>(&mut self, methods: &[Method], path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        let route = Route::new(
            methods.to_vec(),
            join_paths(self.prefix(), path),
            self.scoped_middleware().to_vec(),
            handlers.into_iter().collect(),
        );
        self.push_route(route)
    }

    fn get<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::GET], path, handlers)
    }

    fn head<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::HEAD], path, handlers)
    }

    fn post<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::POST], path, handlers)
    }

    fn put<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::PUT], path, handlers)
    }

    fn delete<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::DELETE], path, handlers)
    }

    fn patch<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::PATCH], path, handlers)
    }

    fn options<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::OPTIONS], path, handlers)
    }

    fn connect<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::CONNECT], path, handlers)
    }

    fn trace<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&[Method::TRACE], path, handlers)
    }

    fn all<I>(&mut self, path: &str, handlers: I) -> &mut Route
    where
        I: IntoIterator<Item = Handler>,
        Self: Sized,
    {
        self.add(&ALL_METHODS, path, handlers)
    }

    /// Open a group whose routes share `prefix` and the middleware in scope.
    fn group(&mut self, prefix: &str) -> Group<'_>
    where
        Self: Sized,
    {
        Group::new(self, prefix)
    }
}

/// Routes under a common prefix with their own middleware.
///
/// Middleware added with [`Group::use_middleware`] applies to routes
/// registered on the group afterwards, including nested groups.
pub struct Group<'a> {
    parent: &'a mut dyn RouteRegistrar,
    prefix: String,
    middleware: Vec<Handler>,
}

impl<'a> Group<'a> {
    fn new(parent: &'a mut dyn RouteRegistrar, prefix: &str) -> Self {
        let prefix = join_paths(parent.prefix(), prefix);
        let middleware = parent.scoped_middleware().to_vec();
        Self {
            parent,
            prefix,
            middleware,
        }
    }

    pub fn use_middleware(&mut self, middleware: Handler) -> &mut Self {
        self.middleware.push(middleware);
        self
    }
}

impl RouteRegistrar for Group<'_> {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped_middleware(&self) -> &[Handler] {
        &self.middleware
    }

    fn push_route(&mut self, route: Route) -> &mut Route {
        self.parent.push_route(route)
    }
}

fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let joined = if path.is_empty() {
        prefix.to_string()
    } else if path.starts_with('/') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}/{path}")
    };
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler;

    #[derive(Default)]
    struct Routes {
        routes: Vec<Route>,
    }

    impl RouteRegistrar for Routes {
        fn prefix(&self) -> &str {
            ""
        }

        fn scoped_middleware(&self) -> &[Handler] {
            &[]
        }

        fn push_route(&mut self, route: Route) -> &mut Route {
            self.routes.push(route);
            let last = self.routes.len() - 1;
            &mut self.routes[last]
        }
    }

    fn noop() -> Handler {
        handler(|_c| Box::pin(async {}))
    }

    #[test]
    fn joins_prefixes() {
        assert_eq!(join_paths("", "/x"), "/x");
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/api/", "users"), "/api/users");
        assert_eq!(join_paths("/api", ""), "/api");
        assert_eq!(join_paths("/api", "/"), "/api/");
    }

    #[test]
    fn nested_groups_prefix_and_inherit_middleware() {
        let mut routes = Routes::default();
        {
            let mut api = routes.group("/api");
            api.use_middleware(noop());
            api.get("/health", [noop()]);
            let mut v1 = api.group("/v1");
            v1.use_middleware(noop());
            v1.post("/users/:id", [noop(), noop()]).named("update-user");
        }

        assert_eq!(routes.routes.len(), 2);
        assert_eq!(routes.routes[0].path(), "/api/health");
        assert_eq!(routes.routes[0].middleware().len(), 1);
        let user = &routes.routes[1];
        assert_eq!(user.path(), "/api/v1/users/:id");
        assert_eq!(user.methods(), &[Method::POST]);
        assert_eq!(user.middleware().len(), 2);
        assert_eq!(user.handlers().len(), 2);
        assert_eq!(user.name(), Some("update-user"));
    }

    #[test]
    fn cache_options_select_methods() {
        let mut routes = Routes::default();
        routes.get("/a", [noop()]);
        routes.post("/b", [noop()]);
        routes.post("/c", [noop()]).cache(Duration::from_secs(3));
        routes.get("/d", [noop()]).no_cache();

        let [a, b, c, d] = &routes.routes[..] else {
            panic!("expected four routes");
        };
        assert!(a.caches(&Method::GET));
        assert!(!b.caches(&Method::POST));
        assert!(c.caches(&Method::POST));
        assert_eq!(c.cache_options().ttl, Some(Duration::from_secs(3)));
        assert!(!d.caches(&Method::GET));
    }

    #[test]
    fn all_registers_every_method() {
        let mut routes = Routes::default();
        routes.all("/any", [noop()]);
        assert_eq!(routes.routes[0].methods().len(), ALL_METHODS.len());
    }
}
