use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    Json,
    body::Body as AxumBody,
    extract::{Request, State},
    http::{Response, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::middleware::{StripPrefix, request_timing_middleware},
    config::models::{MergedConfiguration, RouteSpec},
    core::{backend::Backend, router::Router},
    metrics,
    ports::http_handler::{RequestHandler, SharedHandler},
    tracing_setup::create_rebuild_span,
};

pub const HEALTH_PATH: &str = "/_ruleway/health";
pub const CONFIG_PATH: &str = "/_ruleway/config";

/// Outcome of one router rebuild.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub installed: usize,
    /// Qualified names of the routes that were skipped.
    pub failed: Vec<String>,
}

/// HTTP entry point holding the active router.
///
/// The router is replaced wholesale on every configuration apply; requests in
/// flight keep the snapshot they loaded.
pub struct HttpHandler {
    router: ArcSwap<Router>,
    merged: ArcSwap<MergedConfiguration>,
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            router: ArcSwap::from_pointee(Router::new()),
            merged: ArcSwap::from_pointee(MergedConfiguration::new()),
        }
    }

    /// Snapshot of the active router.
    pub fn router(&self) -> Arc<Router> {
        self.router.load_full()
    }

    /// Merged configuration the active router was built from.
    pub fn merged(&self) -> Arc<MergedConfiguration> {
        self.merged.load_full()
    }

    /// Build a fresh router from `merged` and swap it in.
    pub fn rebuild(&self, merged: &MergedConfiguration) -> RebuildReport {
        let span = create_rebuild_span(merged.len());
        let _enter = span.enter();

        let (router, report) = build_router(merged);
        span.record("installed", report.installed);

        self.router.store(Arc::new(router));
        self.merged.store(Arc::new(merged.clone()));
        metrics::set_routes_installed(report.installed);

        if report.failed.is_empty() {
            tracing::info!(routes = report.installed, "Router rebuilt");
        } else {
            tracing::warn!(
                routes = report.installed,
                failed = ?report.failed,
                "Router rebuilt with skipped routes"
            );
        }
        report
    }

    /// Listener to register on the configuration watcher.
    pub fn listener(self: &Arc<Self>) -> impl Fn(&MergedConfiguration) + Send + Sync + 'static {
        let handler = Arc::clone(self);
        move |merged| {
            handler.rebuild(merged);
        }
    }

    /// Dispatch a request through the active router.
    pub async fn handle_request(&self, req: Request) -> Response<AxumBody> {
        let router = self.router.load_full();
        router.handle(req).await
    }

    /// Axum application: admin endpoints first, everything else proxied.
    pub fn into_app(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route(HEALTH_PATH, get(health))
            .route(CONFIG_PATH, get(current_config))
            .fallback(proxy)
            .with_state(self)
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(TraceLayer::new_for_http())
    }
}

/// Build the handler chain for one route declaration.
fn route_handler(name: &str, spec: &RouteSpec) -> Result<SharedHandler, String> {
    let backend = Backend::new(name, &spec.server)
        .map_err(|e| e.to_string())?
        .with_rule(spec.rule.clone());

    let backend: SharedHandler = Arc::new(backend);
    if spec.path.is_empty() {
        Ok(backend)
    } else {
        Ok(Arc::new(StripPrefix::new([spec.path.clone()], backend)))
    }
}

/// Compile every declaration into a new router. A broken declaration is
/// logged and skipped; it never prevents the others from being installed.
pub fn build_router(merged: &MergedConfiguration) -> (Router, RebuildReport) {
    let mut router = Router::new();
    let mut report = RebuildReport::default();

    for (name, spec) in merged {
        let handler = match route_handler(name, spec) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(route = %name, server = %spec.server, "Skipping route: {}", e);
                metrics::increment_route_build_failures(name);
                report.failed.push(name.clone());
                continue;
            }
        };

        match router.add_route(&spec.rule, 0, handler) {
            Ok(()) => report.installed += 1,
            Err(e) => {
                tracing::error!(route = %name, rule = %spec.rule, "Skipping route: {}", e);
                metrics::increment_route_build_failures(name);
                report.failed.push(name.clone());
            }
        }
    }

    (router, report)
}

async fn health(State(handler): State<Arc<HttpHandler>>) -> impl IntoResponse {
    let routes = handler.router().len();
    Json(serde_json::json!({
        "status": "ok",
        "routes": routes,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn current_config(State(handler): State<Arc<HttpHandler>>) -> impl IntoResponse {
    let merged = handler.merged();
    (StatusCode::OK, Json(MergedConfiguration::clone(&merged)))
}

async fn proxy(State(handler): State<Arc<HttpHandler>>, req: Request) -> Response<AxumBody> {
    handler.handle_request(req).await
}
