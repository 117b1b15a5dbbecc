//! HTTP transport and the render worker.
//!
//! V8 isolates are not `Send`, so renders run on a dedicated OS thread that
//! owns a single-threaded tokio runtime. The HTTP side talks to it over an
//! mpsc channel and implements `PageRender` with that handle, which keeps
//! axum's handlers trivially `Send` while renders stay serialized on the
//! worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::HeaderName, HeaderValue, Response, StatusCode, Uri};
use axum::Router;
use tokio::sync::{mpsc, oneshot};

use crate::assets::AssetStore;
use crate::config::SiteConfig;
use crate::dispatch::{Dispatcher, PageRender, RenderResult};
use crate::error::RenderError;
use crate::render::Renderer;

struct RenderJob {
    path: String,
    reply: oneshot::Sender<Result<String, RenderError>>,
}

/// Channel handle to the render worker thread.
#[derive(Clone)]
pub struct RenderHandle {
    tx: mpsc::Sender<RenderJob>,
}

#[async_trait]
impl PageRender for RenderHandle {
    async fn render_page(&self, path: &str) -> Result<String, RenderError> {
        let (reply, rx) = oneshot::channel();
        let job = RenderJob {
            path: path.to_string(),
            reply,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| RenderError::runtime(anyhow!("render worker is gone")))?;
        rx.await
            .map_err(|_| RenderError::runtime(anyhow!("render worker dropped the job")))?
    }
}

/// Start the render worker thread and return a handle for dispatching jobs
/// to it. The thread exits when every handle is dropped.
pub fn spawn_render_worker(
    config: SiteConfig,
    assets: Arc<AssetStore>,
) -> anyhow::Result<RenderHandle> {
    let (tx, mut rx) = mpsc::channel::<RenderJob>(32);

    std::thread::Builder::new()
        .name("render-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    tracing::error!(%err, "render worker runtime failed to start");
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                let renderer = match Renderer::new(config, assets) {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::error!(%err, "renderer failed to initialize");
                        return;
                    }
                };
                while let Some(job) = rx.recv().await {
                    let result = renderer.render(&job.path).await;
                    let result = result.map(|page| {
                        emit_console(&job.path, &page.console);
                        if let Some(src) = &page.loader_src {
                            tracing::debug!(path = %job.path, loader = %src, "hydration loader emitted");
                        }
                        page.html
                    });
                    // A closed reply channel just means the client went away.
                    let _ = job.reply.send(result);
                }
            });
        })
        .context("failed to spawn render worker thread")?;

    Ok(RenderHandle { tx })
}

/// Re-emit application console output into the host's structured log.
fn emit_console(path: &str, console: &crate::ops::ConsoleOutput) {
    for line in &console.logs {
        tracing::info!(target: "app", path, "{line}");
    }
    for line in &console.warns {
        tracing::warn!(target: "app", path, "{line}");
    }
    for line in &console.errors {
        tracing::error!(target: "app", path, "{line}");
    }
}

/// Serve the site on `addr` until the process is stopped.
pub async fn serve(addr: SocketAddr, config: SiteConfig) -> anyhow::Result<()> {
    let assets = Arc::new(AssetStore::load(&config.site_dir).with_context(|| {
        format!("failed to load site assets from {}", config.site_dir.display())
    })?);
    tracing::info!(assets = assets.len(), site = %config.site_dir.display(), "site loaded");

    let handle = spawn_render_worker(config, Arc::clone(&assets))?;
    let dispatcher = Arc::new(Dispatcher::new(assets, Box::new(handle)));

    let app = Router::new()
        .fallback(handle_request)
        .with_state(dispatcher);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_request(State(dispatcher): State<Arc<Dispatcher>>, uri: Uri) -> Response<Body> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let result = dispatcher.dispatch(path).await;
    into_response(result)
}

fn into_response(result: RenderResult) -> Response<Body> {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &result.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                continue;
            };
            headers.insert(name, value);
        }
    }
    response
        .body(Body::from(result.body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
