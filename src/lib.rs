//! Server-side prerenderer for client-rendered single-page applications.
//!
//! A request for a page executes the site's JavaScript bundle inside a
//! sandboxed V8 isolate against a synthetic document, serializes the
//! resulting tree to HTML, and rewrites the markup so the real browser
//! hydrates by re-running the application after load.

pub mod assets;
pub mod bundler;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod fetch;
pub mod hydrate;
pub mod mime;
pub mod ops;
pub mod render;
pub mod server;
pub mod shims;

pub use config::{AppSource, SiteConfig};
pub use dispatch::{Dispatcher, PageRender, RenderResult};
pub use error::{BundleError, RenderError};
pub use render::{RenderedPage, Renderer};
