use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::exporter::AppState;

/// Cap on the `identifiers` query parameter, protecting the provider APIs
/// from fan-out amplification through a single request.
const MAX_INSTANCE_IDENTIFIERS: usize = 5;

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    identifiers: Option<String>,
}

#[instrument(skip(state, query), fields(http.route = "/metrics"))]
pub async fn metrics(
    Query(query): Query<MetricsQuery>,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    // An empty identifiers= parameter means "all instances".
    let identifiers = query
        .identifiers
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .map(parse_identifiers);

    if let Some(identifiers) = &identifiers {
        if identifiers.len() > MAX_INSTANCE_IDENTIFIERS {
            warn!(
                provided = identifiers.len(),
                "rejecting request, too many identifiers"
            );
            return (
                StatusCode::BAD_REQUEST,
                headers,
                format!(
                    "Too many instance identifiers provided. Maximum allowed: {}, provided: {}",
                    MAX_INSTANCE_IDENTIFIERS,
                    identifiers.len()
                ),
            );
        }
    }

    // Dropping the guard on client disconnect cancels the whole pipeline.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = match identifiers {
        Some(identifiers) => {
            debug!(?identifiers, "scraping selected instances");
            state
                .collector
                .collect_for_instances(&cancel, identifiers)
                .await
        }
        None => {
            debug!("scraping all instances");
            state.collector.collect(&cancel).await
        }
    };

    if let Err(err) = &outcome.result {
        error!("scrape degraded: {err:#}");
        state.up_gauge.set(0.0);
    } else {
        state.up_gauge.set(1.0);
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let encoded = encoder
        .encode(&state.registry.gather(), &mut buffer)
        .and_then(|()| encoder.encode(&outcome.families, &mut buffer));

    match encoded {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, headers, body),
            Err(err) => {
                error!("Failed to encode metrics: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    headers,
                    format!("Error encoding metrics: {err}"),
                )
            }
        },
        Err(err) => {
            error!("Failed to encode metrics: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error encoding metrics: {err}"),
            )
        }
    }
}

fn parse_identifiers(raw: &str) -> Vec<String> {
    raw.split(',').map(|id| id.trim().to_string()).collect()
}
