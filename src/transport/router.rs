//! Exact-match route table (component F).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::handler::{HandlerFactory, RouteParams};

struct RouteEntry {
    factory: Arc<dyn HandlerFactory>,
    params: RouteParams,
}

/// Maps a request path to a handler factory plus a fixed parameter bag.
/// Lookup is exact-match only; there is no wildcard or prefix matching.
/// Registering the same path twice overwrites the previous entry.
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(
        &self,
        path: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
        params: RouteParams,
    ) {
        self.routes
            .write()
            .insert(path.into(), RouteEntry { factory, params });
    }

    pub fn route(&self, path: &str) -> Option<(Arc<dyn HandlerFactory>, RouteParams)> {
        self.routes
            .read()
            .get(path)
            .map(|entry| (Arc::clone(&entry.factory), entry.params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handler::{NoopHandler, RouteParams};

    struct NoopFactory;
    impl HandlerFactory for NoopFactory {
        fn build(&self, _params: &RouteParams) -> Arc<dyn crate::transport::handler::WebTransportHandler> {
            Arc::new(NoopHandler)
        }
    }

    #[test]
    fn exact_match_only() {
        let router = Router::new();
        router.add_route("/broadcast", Arc::new(NoopFactory), RouteParams::default());
        assert!(router.route("/broadcast").is_some());
        assert!(router.route("/broadcast/").is_none());
        assert!(router.route("/broadcas").is_none());
        assert!(router.route("/unknown").is_none());
    }

    #[test]
    fn registering_same_path_twice_overwrites() {
        let router = Router::new();
        let mut params_a = RouteParams::default();
        params_a.insert("tag".into(), "a".into());
        let mut params_b = RouteParams::default();
        params_b.insert("tag".into(), "b".into());

        router.add_route("/x", Arc::new(NoopFactory), params_a);
        router.add_route("/x", Arc::new(NoopFactory), params_b);

        let (_, params) = router.route("/x").unwrap();
        assert_eq!(params.get("tag").map(String::as_str), Some("b"));
    }
}
