//! Render Pipeline: produces final HTML text for a logical page request.
//!
//! Per render call: build a synthetic document from the shell, apply the
//! compatibility shims, locate or build the application bundle, inject and
//! execute it, await content-loaded readiness, serialize, and rewrite the
//! bootstrap into the deferred client loader. Each call owns its document
//! exclusively; the only shared state it touches is the read-only asset
//! store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use url::Url;

use crate::assets::AssetStore;
use crate::bundler::{Bundler, CachedBundler, EsbuildBundler};
use crate::config::{AppSource, SiteConfig};
use crate::document::{DocumentOptions, SyntheticDocument, SHELL_TEMPLATE};
use crate::error::RenderError;
use crate::hydrate;
use crate::ops::ConsoleOutput;
use crate::shims::ShimOutcome;

/// Output of one render call.
pub struct RenderedPage {
    pub html: String,
    /// URL the deferred hydration loader points at, when one was emitted.
    pub loader_src: Option<String>,
    /// Console output the application produced while rendering.
    pub console: ConsoleOutput,
}

pub struct Renderer {
    config: SiteConfig,
    assets: Arc<AssetStore>,
    base_url: Url,
    // Only exercised in entry mode. The entry point is fixed for the
    // process lifetime, so the bundle is built once and cached.
    bundler: CachedBundler<EsbuildBundler>,
}

impl Renderer {
    pub fn new(config: SiteConfig, assets: Arc<AssetStore>) -> Result<Self, RenderError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RenderError::runtime(anyhow!("invalid base URL: {}", e)))?;
        Ok(Self {
            config,
            assets,
            base_url,
            bundler: CachedBundler::new(EsbuildBundler::default()),
        })
    }

    /// Render the page for `path`. The path only affects the synthetic
    /// window's location; the shell and bundle are per-site.
    pub async fn render(&self, path: &str) -> Result<RenderedPage, RenderError> {
        match self.config.render_timeout_ms {
            Some(ms) => self.render_with_deadline(path, ms).await,
            None => self.render_inner(path).await,
        }
    }

    async fn render_with_deadline(
        &self,
        path: &str,
        ms: u64,
    ) -> Result<RenderedPage, RenderError> {
        // The async timeout covers suspension points (bundler, fetch,
        // timers); it cannot fire while a JS busy-loop holds the thread, so
        // the document arms a separate watchdog around script execution.
        let result = tokio::time::timeout(Duration::from_millis(ms), self.render_inner(path)).await;
        match result {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(err)) if is_termination(&err) => Err(RenderError::Timeout(ms)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RenderError::Timeout(ms)),
        }
    }

    async fn render_inner(&self, path: &str) -> Result<RenderedPage, RenderError> {
        let shell_html = self.load_shell()?;
        let base_url = self
            .base_url
            .join(path)
            .unwrap_or_else(|_| self.base_url.clone());

        let mut document = SyntheticDocument::new(DocumentOptions {
            shell_html,
            base_url,
            scripts_enabled: true,
            load_external_resources: self.config.load_external_resources,
            allowed_origins: self.config.allowed_origins.clone(),
            max_heap_size: self.config.max_heap_size,
        })?;

        // Armed for the whole render: bundle execution, the event-loop
        // drain and serialization all run script on this thread, and any of
        // them can be wedged by a busy-loop the async timeout cannot reach.
        let _watchdog = Watchdog::arm(document.isolate_handle(), self.config.render_timeout_ms);

        let reports = document.install_polyfills();
        let installed = reports
            .iter()
            .filter(|r| r.outcome == ShimOutcome::Installed)
            .count();
        tracing::debug!(installed, total = reports.len(), "polyfills applied");

        let bundle = self.locate_bundle().await?;

        let injected = match bundle {
            Some(code) => {
                document.inject_bootstrap(&code)?;
                true
            }
            None => {
                // Degrade to the static shell: no injection, no rewrite.
                tracing::warn!(path, "no application bundle located; serving shell as-is");
                document.finish_loading()?;
                false
            }
        };

        document.wait_ready().await?;
        let html = document.serialize()?;
        let console = document.console_output();

        if !injected {
            return Ok(RenderedPage {
                html,
                loader_src: None,
                console,
            });
        }

        let page = hydrate::rewrite_for_hydration(&html)?;
        Ok(RenderedPage {
            html: page.html,
            loader_src: page.loader_src,
            console,
        })
    }

    fn load_shell(&self) -> Result<String, RenderError> {
        let shell_path = self.config.shell_path();
        if shell_path.is_file() {
            Ok(std::fs::read_to_string(&shell_path)?)
        } else {
            Ok(SHELL_TEMPLATE.to_string())
        }
    }

    /// Locate the bundle to execute: by filename convention under the assets
    /// directory (prebuilt), or through the bundler adapter (entry mode).
    /// `None` means the render degrades to the static shell.
    async fn locate_bundle(&self) -> Result<Option<String>, RenderError> {
        match &self.config.source {
            AppSource::Prebuilt => {
                let Some((path, bytes)) = self.assets.find_main_bundle(
                    &self.config.assets_dir,
                    &self.config.bundle_prefix,
                    &self.config.bundle_suffix,
                ) else {
                    return Ok(None);
                };
                let code = std::str::from_utf8(bytes)
                    .map_err(|_| RenderError::BundleEncoding(path.to_string()))?;
                Ok(Some(code.to_string()))
            }
            AppSource::Entry { entry } => {
                let code = self.bundler.bundle(entry).await?;
                Ok(Some(code))
            }
        }
    }
}

/// Terminates script execution when a render outlives its deadline. Armed
/// before any application code runs and disarmed on drop, after
/// serialization. Runs on its own thread because the render worker's only
/// thread is exactly what a JS busy-loop would block.
struct Watchdog {
    done: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(handle: deno_core::v8::IsolateHandle, timeout_ms: Option<u64>) -> Option<Self> {
        let ms = timeout_ms?;
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            if !flag.load(Ordering::SeqCst) {
                handle.terminate_execution();
            }
        });
        Some(Self { done })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// V8 termination surfaces as a generic runtime error; map the known shapes
/// back to a timeout.
fn is_termination(err: &RenderError) -> bool {
    let text = err.to_string();
    text.contains("execution terminated") || text.contains("unresolved promise")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_errors_are_recognized() {
        let err = RenderError::runtime(anyhow!("Uncaught Error: execution terminated"));
        assert!(is_termination(&err));
        let err = RenderError::runtime(anyhow!("ReferenceError: x is not defined"));
        assert!(!is_termination(&err));
    }

    #[tokio::test]
    async fn test_busy_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/index-loop.js"), "for (;;) {}").unwrap();

        let config = SiteConfig {
            site_dir: dir.path().to_path_buf(),
            render_timeout_ms: Some(250),
            ..Default::default()
        };
        let assets = Arc::new(AssetStore::load(dir.path()).unwrap());
        let renderer = Renderer::new(config, assets).unwrap();

        let err = renderer.render("/").await.unwrap_err();
        assert!(matches!(err, RenderError::Timeout(250)), "got: {err}");
    }

    // A busy-loop deferred into a timer callback runs during the event-loop
    // drain, after bundle injection returned. The deadline must still cut it
    // off; otherwise one page wedges the worker thread for good.
    #[tokio::test]
    async fn test_busy_loop_in_timer_callback_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(
            dir.path().join("assets/index-defer.js"),
            "setTimeout(() => { for (;;) {} }, 0);",
        )
        .unwrap();

        let config = SiteConfig {
            site_dir: dir.path().to_path_buf(),
            render_timeout_ms: Some(250),
            ..Default::default()
        };
        let assets = Arc::new(AssetStore::load(dir.path()).unwrap());
        let renderer = Renderer::new(config, assets).unwrap();

        let err = renderer.render("/").await.unwrap_err();
        assert!(matches!(err, RenderError::Timeout(250)), "got: {err}");
    }
}
