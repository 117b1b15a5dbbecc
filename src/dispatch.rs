//! Request dispatch: maps an incoming request path to a static asset, a
//! rendered page, or a not-found response. Transport-agnostic; the HTTP
//! server translates `RenderResult` into its own response type.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::assets::AssetStore;
use crate::error::RenderError;
use crate::mime;

/// A finished response, expressed independently of the HTTP layer.
pub struct RenderResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RenderResult {
    pub fn ok(content_type: &str, body: Bytes) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: vec![("content-type".to_string(), mime::PLAIN.to_string())],
            body: Bytes::from_static(b"Not Found"),
        }
    }

    pub fn internal_error() -> Self {
        Self {
            status: 500,
            headers: vec![("content-type".to_string(), mime::PLAIN.to_string())],
            body: Bytes::from_static(b"Internal Server Error"),
        }
    }
}

/// The page rendering seam the dispatcher calls through. The production
/// implementation forwards to the render worker thread.
#[async_trait]
pub trait PageRender: Send + Sync {
    async fn render_page(&self, path: &str) -> Result<String, RenderError>;
}

pub struct Dispatcher {
    assets: std::sync::Arc<AssetStore>,
    renderer: Box<dyn PageRender>,
}

impl Dispatcher {
    pub fn new(assets: std::sync::Arc<AssetStore>, renderer: Box<dyn PageRender>) -> Self {
        Self { assets, renderer }
    }

    /// Route one request. Static assets win over page rendering; only paths
    /// that look like pages ("/", "*.html", "*.htm") reach the renderer.
    pub async fn dispatch(&self, raw_path: &str) -> RenderResult {
        let path = normalize_path(raw_path);

        if let Some(body) = self.assets.get(&path) {
            return RenderResult::ok(mime::content_type(&path), body.clone());
        }

        if !is_page_path(&path) {
            return RenderResult::not_found();
        }

        match self.renderer.render_page(&path).await {
            Ok(html) => RenderResult::ok(mime::HTML, Bytes::from(html)),
            Err(err) if err.is_timeout() => {
                tracing::error!(path, %err, "render deadline exceeded");
                RenderResult::internal_error()
            }
            Err(err) => {
                tracing::error!(path, %err, "render failed");
                RenderResult::internal_error()
            }
        }
    }
}

/// Strip the query and fragment, percent-decode, and force a leading slash.
fn normalize_path(raw: &str) -> String {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let trimmed = &raw[..end];
    let decoded = percent_decode_str(trimmed).decode_utf8_lossy();
    if decoded.starts_with('/') {
        decoded.into_owned()
    } else {
        format!("/{decoded}")
    }
}

fn is_page_path(path: &str) -> bool {
    path == "/" || path.ends_with(".html") || path.ends_with(".htm")
}
