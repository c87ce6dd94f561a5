//! HTTP read surface.
//!
//! A single endpoint, `GET /logs?limit=N`, returning stored records
//! most-recent-first as a JSON array. Persistence failures map to 500;
//! a malformed query string is rejected with 400 by the extractor.
//!
//! [`HttpServer`] owns its router and listener outright, so it can be
//! constructed, inspected and torn down without any global registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{error, info};

use crate::record::LogRecord;
use crate::usecase::ListLogsUseCase;

#[derive(Clone)]
struct AppState {
    list_logs: Arc<ListLogsUseCase>,
}

/// Query parameters accepted by `GET /logs`.
#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<u32>,
}

/// The service's HTTP server.
pub struct HttpServer {
    listener: tokio::net::TcpListener,
    router: Router,
}

impl HttpServer {
    /// Build the route table. Exposed separately so tests can drive the
    /// router without binding a socket.
    pub fn router(list_logs: Arc<ListLogsUseCase>) -> Router {
        Router::new()
            .route("/logs", get(list_logs_handler))
            .with_state(AppState { list_logs })
    }

    /// Bind the listen address.
    ///
    /// Failure here is a fatal startup error for the service.
    pub async fn bind(addr: &str, list_logs: Arc<ListLogsUseCase>) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: Self::router(list_logs),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests until the process exits.
    pub async fn serve(self) -> std::io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "HTTP server listening");
        axum::serve(self.listener, self.router).await
    }
}

async fn list_logs_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<LogRecord>>, StatusCode> {
    let records = state.list_logs.execute(params.limit).await.map_err(|e| {
        error!(error = %e, "Failed to list log records");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(records))
}
