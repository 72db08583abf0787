//! Radix-tree route table.
//!
//! One matchit tree per method. Registration happens during setup only;
//! [`RouteTable::seal`] composes every route's middleware stack once, and
//! from then on the table is read-only and shared across connection tasks.

use std::collections::HashMap;

use matchit::Router as MatchitRouter;

use crate::error::ConfigError;
use crate::handler::BoxedHandler;
use crate::method::Method;
use crate::middleware::{self, BoxedMiddleware};

/// Suffix a file-serving pattern must end with.
pub(crate) const FILE_WILDCARD: &str = "/*filepath";

/// A registered route. Trees store an index into the route list, so the
/// handler can be replaced by its composed form without touching the trees.
struct Route {
    handler: BoxedHandler,
    middlewares: Vec<BoxedMiddleware>,
}

pub(crate) struct RouteTable {
    trees: HashMap<Method, MatchitRouter<usize>>,
    routes: Vec<Route>,
    sealed: bool,
}

/// Outcome of matching a request against the table.
pub(crate) enum Lookup {
    Found {
        handler: BoxedHandler,
        params: Vec<(String, String)>,
    },
    /// The path exists, but only under other methods.
    MethodNotAllowed { allow: Vec<Method> },
    NotFound,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self { trees: HashMap::new(), routes: Vec::new(), sealed: false }
    }

    /// Binds `handler` under `(method, path)`.
    ///
    /// `middlewares` are the group and route scopes, already in order. The
    /// global scope is applied by [`seal`](Self::seal).
    pub(crate) fn register(
        &mut self,
        method: Method,
        path: &str,
        handler: BoxedHandler,
        middlewares: Vec<BoxedMiddleware>,
    ) -> Result<(), ConfigError> {
        if self.sealed {
            return Err(ConfigError::Sealed { method, path: path.to_owned() });
        }

        let pattern = translate(path);
        self.trees
            .entry(method)
            .or_default()
            .insert(pattern, self.routes.len())
            .map_err(|source| ConfigError::InvalidRoute { path: path.to_owned(), source })?;
        self.routes.push(Route { handler, middlewares });
        Ok(())
    }

    /// Composes `global ⊃ group ⊃ route ⊃ handler` for every route and
    /// freezes the table.
    pub(crate) fn seal(&mut self, global: &[BoxedMiddleware]) {
        for route in &mut self.routes {
            let scoped = std::mem::take(&mut route.middlewares);
            route.handler = middleware::compose(route.handler.clone(), global, &scoped);
        }
        self.sealed = true;
    }

    pub(crate) fn lookup(&self, method: &http::Method, path: &str) -> Lookup {
        let wanted = Method::from_http(method);

        if let Some(tree) = wanted.and_then(|m| self.trees.get(&m)) {
            if let Ok(matched) = tree.at(path) {
                let handler = self.routes[*matched.value].handler.clone();
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect();
                return Lookup::Found { handler, params };
            }
        }

        let allow: Vec<Method> = Method::ALL
            .into_iter()
            .filter(|m| Some(*m) != wanted)
            .filter(|m| self.trees.get(m).is_some_and(|tree| tree.at(path).is_ok()))
            .collect();

        if allow.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::MethodNotAllowed { allow }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }
}

/// Checks the file-serving convention before anything is registered.
pub(crate) fn check_file_pattern(path: &str) -> Result<(), ConfigError> {
    if path.ends_with(FILE_WILDCARD) {
        Ok(())
    } else {
        Err(ConfigError::FileRoutePattern(path.to_owned()))
    }
}

/// Rewrites `:name` and `*name` segments into matchit's `{name}` and
/// `{*name}`. Segments already in matchit syntax pass through unchanged.
fn translate(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::request::Request;

    fn ok() -> BoxedHandler {
        (|_req: Request| async { "ok" }).into_boxed_handler()
    }

    #[test]
    fn translates_httprouter_style_patterns() {
        assert_eq!(translate("/item/:id"), "/item/{id}");
        assert_eq!(translate("/static/*filepath"), "/static/{*filepath}");
        assert_eq!(translate("/users/{id}/posts"), "/users/{id}/posts");
        assert_eq!(translate("/"), "/");
    }

    #[test]
    fn lookup_exposes_path_params() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/item/:id", ok(), Vec::new()).unwrap();
        table.seal(&[]);

        match table.lookup(&http::Method::GET, "/item/42") {
            Lookup::Found { params, .. } => {
                assert_eq!(params, [("id".to_owned(), "42".to_owned())]);
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn other_methods_produce_method_not_allowed() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/items", ok(), Vec::new()).unwrap();
        table.register(Method::Post, "/items", ok(), Vec::new()).unwrap();
        table.seal(&[]);

        match table.lookup(&http::Method::DELETE, "/items") {
            Lookup::MethodNotAllowed { allow } => assert_eq!(allow, [Method::Get, Method::Post]),
            _ => panic!("expected 405"),
        }
        assert!(matches!(table.lookup(&http::Method::GET, "/nope"), Lookup::NotFound));
        assert!(matches!(
            table.lookup(&http::Method::TRACE, "/items"),
            Lookup::MethodNotAllowed { .. }
        ));
    }

    #[test]
    fn put_routes_are_not_reachable_as_post() {
        let mut table = RouteTable::new();
        table.register(Method::Put, "/items/:id", ok(), Vec::new()).unwrap();
        table.seal(&[]);

        assert!(matches!(table.lookup(&http::Method::PUT, "/items/1"), Lookup::Found { .. }));
        assert!(matches!(
            table.lookup(&http::Method::POST, "/items/1"),
            Lookup::MethodNotAllowed { .. }
        ));
    }

    #[test]
    fn conflicting_routes_fail_at_registration() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/item/:id", ok(), Vec::new()).unwrap();

        let err = table.register(Method::Get, "/item/:name", ok(), Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRoute { ref path, .. } if path == "/item/:name"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn registration_after_sealing_is_rejected() {
        let mut table = RouteTable::new();
        table.seal(&[]);

        let err = table.register(Method::Get, "/late", ok(), Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Sealed { method: Method::Get, .. }));
    }

    #[test]
    fn file_pattern_must_end_in_wildcard() {
        assert!(check_file_pattern("/static/*filepath").is_ok());
        assert!(matches!(
            check_file_pattern("/static/*filepat"),
            Err(ConfigError::FileRoutePattern(_))
        ));
        assert!(check_file_pattern("/*filepath").is_ok());
    }
}
