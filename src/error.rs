//! Error taxonomy for the render pipeline.
//!
//! Static-asset misses are deliberately not part of this taxonomy: absence is
//! a normal control-flow branch (`Option`) that the dispatcher turns into a
//! 404. Everything here is fatal for the render that raised it, never for the
//! process.

use thiserror::Error;

/// The external bundler failed to produce a bundle for the entry point.
#[derive(Debug, Error)]
#[error("bundler failed for '{entry}': {diagnostic}")]
pub struct BundleError {
    /// Entry point that was being bundled.
    pub entry: String,
    /// The underlying compiler diagnostic (stderr of the bundler, or the
    /// spawn error when the bundler could not be started).
    pub diagnostic: String,
}

/// Failure of a single render call.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The document never signalled content-loaded readiness (or script
    /// execution was cut off) within the configured deadline.
    #[error("render timed out after {0}ms")]
    Timeout(u64),

    /// The synthetic runtime raised while executing application code.
    #[error("synthetic runtime error: {0}")]
    Runtime(#[source] anyhow::Error),

    /// The HTML shell could not be read from disk.
    #[error("failed to read shell: {0}")]
    Shell(#[from] std::io::Error),

    /// A located bundle asset was not valid UTF-8 script text.
    #[error("bundle asset '{0}' is not valid UTF-8")]
    BundleEncoding(String),

    /// The hydration rewrite pass failed on the serialized document.
    #[error("hydration rewrite failed: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

impl RenderError {
    /// Wrap a deno_core / anyhow error raised inside the isolate.
    pub fn runtime(err: anyhow::Error) -> Self {
        RenderError::Runtime(err)
    }

    /// True when this error should be reported with the timeout log marker.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RenderError::Timeout(_))
    }
}
