use std::sync::Arc;

use crate::handler::Handler;

/// Path-prefix routing table.
///
/// Every worker serves from the same table; handlers are shared behind
/// `Arc` and must therefore be `Send + Sync`. Lookup picks the longest
/// registered prefix of the request path, so `/objects/meta` wins over
/// `/objects` for `/objects/meta/42`.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registers `handler` under a path prefix. Builder style, consumes
    /// and returns the router.
    pub fn add(mut self, path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.routes.push((path.into(), Arc::new(handler)));
        self
    }

    pub fn resolve(&self, path: &str) -> Option<&Arc<dyn Handler>> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
