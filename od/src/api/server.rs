//! axum binding for the request surface

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use eyre::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{ApiHandler, RestRequest};

/// Every request goes through [`ApiHandler`], which owns routing
pub fn router(handler: Arc<ApiHandler>) -> Router {
    Router::new().fallback(dispatch).with_state(handler)
}

async fn dispatch(
    State(handler): State<Arc<ApiHandler>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> Response {
    debug!(%method, %uri, "dispatch: called");
    let headers = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_lowercase(), value.to_str().ok()?.to_string())))
        .collect();

    let request = RestRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query,
        headers,
        body: body.to_vec(),
    };
    let response = handler.handle(request).await;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

/// Serve until ctrl-c
pub async fn serve(addr: SocketAddr, handler: Arc<ApiHandler>) -> Result<()> {
    let base_path = handler.base_path().to_string();
    let app = router(handler);

    let listener = TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind {}", addr))?;
    info!(%addr, %base_path, "Onboarding API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;
    Ok(())
}
