//! Ephemeral static file server for the published build context
//!
//! Serves the scratch directory over plain HTTP on a loopback address. The
//! build host reaches it through the ssh reverse tunnel.

use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{CoreError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Grace period for in-flight downloads on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Handle to a running content server
pub struct ContentServer {
    addr: SocketAddr,
    task: Option<JoinHandle<io::Result<()>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl ContentServer {
    /// Bind `addr` and start serving files under `root`.
    ///
    /// Returns once the listener is bound, so connections made after this
    /// point are accepted.
    pub async fn start(root: &Path, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoreError::ServerBind { addr, source })?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let app = router(root.to_path_buf());

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        tracing::info!("Serving {} on http://{}", root.display(), addr);
        Ok(Self {
            addr,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves only if the server stops without being asked to.
    pub async fn failed(&mut self) -> CoreError {
        let Some(task) = self.task.as_mut() else {
            return CoreError::ServerFailed("server is not running".into());
        };
        let res = task.await;
        self.task = None;
        match res {
            Ok(Ok(())) => CoreError::ServerFailed("server exited".into()),
            Ok(Err(e)) => CoreError::ServerFailed(e.to_string()),
            Err(e) => CoreError::ServerFailed(e.to_string()),
        }
    }

    /// Stop accepting connections and wait briefly for in-flight requests
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(Ok(()))) => tracing::debug!("Content server stopped"),
                Ok(Ok(Err(e))) => tracing::warn!("Content server stopped with error: {}", e),
                Ok(Err(e)) => tracing::warn!("Content server task failed: {}", e),
                Err(_) => {
                    tracing::warn!("Content server did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn router(root: PathBuf) -> Router {
    Router::new()
        .route("/{*path}", get(serve_file))
        .with_state(Arc::new(root))
}

async fn serve_file(State(root): State<Arc<PathBuf>>, UrlPath(path): UrlPath<String>) -> Response {
    let Some(relative) = confine(&path) else {
        tracing::debug!("Rejected request for {:?}", path);
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    };
    let full = root.join(relative);

    let file = match tokio::fs::File::open(&full).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Not found: {}", path);
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            tracing::warn!("Failed to open {}: {}", full.display(), e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let len = match file.metadata().await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!("Failed to stat {}: {}", full.display(), e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::debug!("Serving {} ({} bytes)", path, len);
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(chunks(file)),
    )
        .into_response()
}

/// Stream a file in fixed-size chunks; ends after the first read error
fn chunks(
    file: tokio::fs::File,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Map a request path onto a relative path that cannot leave the root
fn confine(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
