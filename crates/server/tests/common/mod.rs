//! Server test utilities.

pub mod fixtures;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use depot_core::config::AppConfig;
use depot_server::{AppState, create_router};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server proxying the given storage server URLs.
    pub fn new(servers: Vec<String>) -> Self {
        Self::with_config(servers, |_| {})
    }

    /// Create a test server with custom config modifications.
    pub fn with_config<F>(servers: Vec<String>, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path().to_path_buf(), servers);
        modifier(&mut config);

        depot_server::metrics::register_metrics();
        let state = AppState::from_config(config).expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Issue one request against the router.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::empty()).expect("request construction"))
            .await
            .expect("infallible router")
    }

    /// Wait until a condition holds or a 5 second deadline passes.
    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut(&AppState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(&self.state) {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached within deadline");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Collect a response body.
#[allow(dead_code)]
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collection")
        .to_vec()
}
