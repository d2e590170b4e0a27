use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;

use crate::collector::InsightsCollector;
use crate::config::Settings;
use crate::manager::RegionScheduler;

mod handlers;
pub mod shutdown;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: Option<&str> = built_info::GIT_COMMIT_HASH;

/// Shared state handed to the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<InsightsCollector>,
    pub registry: Registry,
    pub up_gauge: Gauge,
}

/// Build the self-metrics registry: build info and the up gauge that
/// reflects the outcome of the most recent scrape.
fn build_registry() -> Result<(Registry, Gauge)> {
    let registry = Registry::new();

    let up_gauge = Gauge::new(
        "dbi_up",
        "Whether the last scrape completed without a terminal error (1) or not (0)",
    )
    .expect("Failed to create dbi_up gauge");
    registry
        .register(Box::new(up_gauge.clone()))
        .context("Failed to register dbi_up gauge")?;

    let build_info = GaugeVec::new(
        Opts::new("dbi_exporter_build_info", "Build information"),
        &["version", "commit", "arch"],
    )
    .expect("Failed to create dbi_exporter_build_info GaugeVec");

    let version = env!("CARGO_PKG_VERSION");
    let commit = GIT_COMMIT_HASH.unwrap_or("unknown");
    build_info
        .with_label_values(&[version, commit, env::consts::ARCH])
        .set(1.0);
    registry
        .register(Box::new(build_info))
        .context("Failed to register dbi_exporter_build_info GaugeVec")?;

    info!("Registered build info: version={version} commit={commit}");
    Ok((registry, up_gauge))
}

/// Build the shared state for the router from an assembled scheduler.
///
/// # Errors
///
/// Returns an error if the self-metrics registry cannot be assembled.
pub fn build_state(scheduler: RegionScheduler) -> Result<AppState> {
    let (registry, up_gauge) = build_registry()?;

    Ok(AppState {
        collector: Arc::new(InsightsCollector::new(Arc::new(scheduler))),
        registry,
        up_gauge,
    })
}

/// Assemble the router. Kept separate from [`serve`] so tests can drive it
/// against mock providers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Start the HTTP server and serve scrapes until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(settings: Arc<Settings>, scheduler: RegionScheduler) -> Result<()> {
    let state = build_state(scheduler)?;
    let app = router(state);

    let port = settings.export.port;
    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!(
        region = %settings.region,
        port,
        "dbi_exporter {} listening on [::]:{port}",
        env!("CARGO_PKG_VERSION"),
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal_handler())
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
