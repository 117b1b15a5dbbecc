//! Bundler Adapter: turns a source entry point into a single self-executing,
//! browser-runnable script body by shelling out to an external bundler.
//!
//! The bundler is an opaque service from the pipeline's point of view: entry
//! path in, bundle text out or a `BundleError` carrying the compiler
//! diagnostic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::BundleError;

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, entry: &Path) -> Result<String, BundleError>;
}

/// Invokes `esbuild` as a subprocess, inlining all module dependencies into
/// an immediately-invoked bundle targeting a browser execution context.
pub struct EsbuildBundler {
    binary: PathBuf,
}

impl EsbuildBundler {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for EsbuildBundler {
    fn default() -> Self {
        Self::new("esbuild")
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(&self, entry: &Path) -> Result<String, BundleError> {
        let output = Command::new(&self.binary)
            .arg(entry)
            .arg("--bundle")
            .arg("--format=iife")
            .arg("--platform=browser")
            .arg("--log-level=warning")
            .output()
            .await
            .map_err(|e| BundleError {
                entry: entry.display().to_string(),
                diagnostic: format!("failed to run '{}': {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(BundleError {
                entry: entry.display().to_string(),
                diagnostic: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| BundleError {
            entry: entry.display().to_string(),
            diagnostic: String::from("bundler produced non-UTF-8 output"),
        })
    }
}

/// Process-wide cache around another bundler, for deployments that always
/// render the same fixed entry point. The entry is immutable for the process
/// lifetime, so no invalidation is needed; failures are not cached, so a
/// transient bundler error is retried on the next render.
pub struct CachedBundler<B> {
    inner: B,
    cell: OnceCell<String>,
}

impl<B: Bundler> CachedBundler<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            cell: OnceCell::new(),
        }
    }
}

#[async_trait]
impl<B: Bundler> Bundler for CachedBundler<B> {
    async fn bundle(&self, entry: &Path) -> Result<String, BundleError> {
        self.cell
            .get_or_try_init(|| self.inner.bundle(entry))
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_missing_binary_is_a_bundle_error() {
        let bundler = EsbuildBundler::new("definitely-not-an-installed-bundler");
        let err = bundler.bundle(Path::new("app.js")).await.unwrap_err();
        assert_eq!(err.entry, "app.js");
        assert!(err.diagnostic.contains("failed to run"));
    }

    struct CountingBundler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Bundler for CountingBundler {
        async fn bundle(&self, _entry: &Path) -> Result<String, BundleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(String::from("(() => {})();"))
        }
    }

    #[tokio::test]
    async fn test_cached_bundler_builds_once() {
        let cached = CachedBundler::new(CountingBundler {
            calls: AtomicUsize::new(0),
        });
        let first = cached.bundle(Path::new("entry.js")).await.unwrap();
        let second = cached.bundle(Path::new("entry.js")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }
}
