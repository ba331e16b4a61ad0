//! Table pull server
//!
//! Serves table snapshots over HTTP so a collector can fetch them on demand:
//!
//! ```text
//! GET /get_table?table=<name>   → 200 application/x-ndjson (snapshot)
//!                               → 404 unregistered table or no file yet
//!                               → 500 file could not be read
//! ```
//!
//! The server runs on its own thread with a current-thread tokio runtime so
//! that the rest of the client stays synchronous.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{ErrorCategory, Result, TraceError};
use crate::pusher::BATCH_CONTENT_TYPE;
use crate::reader::open_table;
use crate::table::TableRegistry;

/// What the handlers need to open snapshots
pub(crate) struct PullState {
    pub trace_dir: PathBuf,
    pub registry: TableRegistry,
}

#[derive(Debug, Deserialize)]
struct TableQuery {
    table: String,
}

/// Build the pull router
pub(crate) fn router(state: Arc<PullState>) -> Router {
    Router::new()
        .route("/get_table", get(get_table))
        .with_state(state)
}

async fn get_table(
    State(state): State<Arc<PullState>>,
    Query(query): Query<TableQuery>,
) -> Response {
    let table = query.table;
    debug!(table = %table, "pull request");

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut reader = open_table(&state.trace_dir, &state.registry, &table)?;
        let mut body = Vec::with_capacity(reader.len() as usize);
        reader
            .read_to_end(&mut body)
            .map_err(|e| TraceError::io(&table, e))?;
        Ok(body)
    })
    .await;

    match result {
        Ok(Ok(body)) => ([(header::CONTENT_TYPE, BATCH_CONTENT_TYPE)], body).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": "IO_ERROR", "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn error_response(err: &TraceError) -> Response {
    let status = match err {
        TraceError::UnregisteredTable { .. } | TraceError::TableNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        e if e.category() == ErrorCategory::Config => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(json!({ "code": err.error_code(), "error": err.to_string() })),
    )
        .into_response()
}

/// Running pull server
pub(crate) struct PullServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PullServer {
    /// Bind `addr` and start serving
    ///
    /// Binding happens on the calling thread so an unusable address is
    /// reported immediately.
    pub(crate) fn start(addr: SocketAddr, state: PullState) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::new(state));

        let handle = thread::Builder::new()
            .name("evtrace-pull".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "failed to start pull server runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!(error = %e, "failed to register pull server listener");
                            return;
                        }
                    };

                    let shutdown = async {
                        let _ = shutdown_rx.await;
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!(error = %e, "pull server stopped");
                    }
                });
            })?;

        info!(%addr, "pull server listening");
        info!("  GET  /get_table?table=<name>");

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Address actually bound (useful with port 0)
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server thread
    pub(crate) fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("pull server thread panicked");
            }
        }
        debug!(addr = %self.addr, "pull server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_serves_snapshot_and_reports_missing_tables() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("votes.jsonl"), b"{\"a\":1}\n").unwrap();

        let state = PullState {
            trace_dir: dir.path().to_path_buf(),
            registry: TableRegistry::new(["votes", "blocks"]).unwrap(),
        };
        let server = PullServer::start("127.0.0.1:0".parse().unwrap(), state).unwrap();
        let base = format!("http://{}/get_table", server.addr());

        let client = reqwest::blocking::Client::new();

        let ok = client.get(&base).query(&[("table", "votes")]).send().unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        assert_eq!(ok.text().unwrap(), "{\"a\":1}\n");

        let missing = client.get(&base).query(&[("table", "blocks")]).send().unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let unknown = client.get(&base).query(&[("table", "mempool")]).send().unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_str(&unknown.text().unwrap()).unwrap();
        assert_eq!(body["code"], "UNREGISTERED_TABLE");

        drop(client);
        server.shutdown();
    }
}
