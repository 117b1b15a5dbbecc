//! The synthetic document/window pair backing one render.
//!
//! A `SyntheticDocument` owns a fresh V8 isolate loaded with the embedded
//! environment script. It is created for exactly one render call and dropped
//! after serialization; nothing is pooled or reused, so no state can leak
//! between requests.

use anyhow::anyhow;
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};
use url::Url;

use crate::error::RenderError;
use crate::fetch::FetchPolicy;
use crate::ops::{synthetic_env, ConsoleOutput};
use crate::shims::{self, ShimReport};

/// Marker attribute stamped on the injected bootstrap script so the
/// hydration rewrite can identify it structurally, not by text equality.
pub const BOOTSTRAP_MARKER: &str = "data-prerender-bootstrap";

/// Fallback shell used when the deployment ships no `index.html`.
pub const SHELL_TEMPLATE: &str =
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body></body></html>";

pub struct DocumentOptions {
    pub shell_html: String,
    /// Base URL of the synthetic window; must match the serving origin.
    pub base_url: Url,
    pub scripts_enabled: bool,
    pub load_external_resources: bool,
    pub allowed_origins: Vec<String>,
    pub max_heap_size: Option<usize>,
}

pub struct SyntheticDocument {
    runtime: JsRuntime,
}

impl SyntheticDocument {
    /// Build the document from the HTML shell and configure the window.
    pub fn new(options: DocumentOptions) -> Result<Self, RenderError> {
        let create_params = options
            .max_heap_size
            .map(|max_bytes| deno_core::v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![synthetic_env::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        if options.max_heap_size.is_some() {
            runtime.add_near_heap_limit_callback(|current, initial| {
                // Keep the limit where it is so V8 raises an OOM error for
                // this render instead of aborting the process.
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "synthetic document near heap limit"
                );
                current
            });
        }

        runtime.op_state().borrow_mut().put(ConsoleOutput::default());
        runtime.op_state().borrow_mut().put(FetchPolicy {
            base: options.base_url.clone(),
            allowed_origins: options.allowed_origins.clone(),
            enabled: options.load_external_resources,
        });

        let init_code = format!(
            "globalThis.__host.init({}, {}, {{ scripts: {} }});",
            js_string(&options.shell_html),
            js_string(options.base_url.as_str()),
            options.scripts_enabled,
        );
        runtime
            .execute_script("<init>", init_code)
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;

        Ok(Self { runtime })
    }

    /// Apply the compatibility shim layer to this window. Idempotent.
    pub fn install_polyfills(&mut self) -> Vec<ShimReport> {
        shims::install_polyfills(&mut self.runtime)
    }

    /// Append the bundle as an executable script node on the body; executes
    /// it synchronously inside the isolate and fires the load transitions.
    pub fn inject_bootstrap(&mut self, code: &str) -> Result<(), RenderError> {
        let inject = format!(
            "globalThis.__host.injectBootstrap({}, {});",
            js_string(code),
            js_string(BOOTSTRAP_MARKER),
        );
        self.runtime
            .execute_script("<bootstrap>", inject)
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;
        Ok(())
    }

    /// Drive the document to its loaded state without running any bundle;
    /// used when no bundle could be located.
    pub fn finish_loading(&mut self) -> Result<(), RenderError> {
        self.runtime
            .execute_script("<finish>", "globalThis.__host.finishLoading();")
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;
        Ok(())
    }

    /// Suspend until the document signals content-loaded readiness, then
    /// drain the event loop (pending timers, fetches and their
    /// continuations). Proceeds immediately when readiness already passed.
    pub async fn wait_ready(&mut self) -> Result<(), RenderError> {
        let promise = self
            .runtime
            .execute_script("<ready>", "globalThis.__host.whenReady()")
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;

        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;

        let scope = &mut self.runtime.handle_scope();
        let local = deno_core::v8::Local::new(scope, &promise);
        if let Ok(promise) = deno_core::v8::Local::<deno_core::v8::Promise>::try_from(local) {
            match promise.state() {
                deno_core::v8::PromiseState::Fulfilled => Ok(()),
                deno_core::v8::PromiseState::Rejected => {
                    let exception = promise.result(scope);
                    Err(RenderError::runtime(anyhow!(
                        "readiness wait rejected: {}",
                        exception.to_rust_string_lossy(scope)
                    )))
                }
                deno_core::v8::PromiseState::Pending => Err(RenderError::runtime(anyhow!(
                    "document never reached content-loaded readiness"
                ))),
            }
        } else {
            Ok(())
        }
    }

    /// Serialize the document tree to HTML text.
    pub fn serialize(&mut self) -> Result<String, RenderError> {
        let global = self
            .runtime
            .execute_script("<serialize>", "globalThis.__host.serialize()")
            .map_err(|e| RenderError::runtime(anyhow!(e)))?;
        let scope = &mut self.runtime.handle_scope();
        let local = deno_core::v8::Local::new(scope, &global);
        if !local.is_string() {
            return Err(RenderError::runtime(anyhow!(
                "serialization did not produce a string"
            )));
        }
        Ok(local.to_rust_string_lossy(scope))
    }

    /// Console output captured so far from the window.
    pub fn console_output(&mut self) -> ConsoleOutput {
        self.runtime
            .op_state()
            .borrow()
            .borrow::<ConsoleOutput>()
            .clone()
    }

    /// Thread-safe handle used by the render watchdog to cut off execution.
    pub fn isolate_handle(&mut self) -> deno_core::v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }
}

/// Escape arbitrary text as a JS string literal. JSON string syntax is valid
/// JS string syntax.
fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(shell: &str) -> DocumentOptions {
        DocumentOptions {
            shell_html: shell.to_string(),
            base_url: Url::parse("http://localhost:8080/").unwrap(),
            scripts_enabled: true,
            load_external_resources: false,
            allowed_origins: vec![],
            max_heap_size: None,
        }
    }

    #[test]
    fn test_js_string_escaping() {
        assert_eq!(js_string("plain"), "\"plain\"");
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(js_string("line\nbreak"), "\"line\\nbreak\"");
    }

    #[tokio::test]
    async fn test_shell_round_trips_without_bundle() {
        let mut doc =
            SyntheticDocument::new(options("<html><head></head><body><p>hi</p></body></html>"))
                .unwrap();
        doc.finish_loading().unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(html.contains("<p>hi</p>"));
        assert!(html.starts_with("<html>"));
    }

    #[tokio::test]
    async fn test_doctype_preserved() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        doc.finish_loading().unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<body></body>"));
    }

    #[tokio::test]
    async fn test_bootstrap_executes_and_mutates_document() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        doc.install_polyfills();
        doc.inject_bootstrap(
            "const el = document.createElement('div');\
             el.id = 'app';\
             el.textContent = 'rendered';\
             document.body.appendChild(el);",
        )
        .unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(html.contains("<div id=\"app\">rendered</div>"));
        // The bootstrap node itself is still in the tree at this stage; the
        // hydration rewrite removes it from the serialized output.
        assert!(html.contains(BOOTSTRAP_MARKER));
    }

    #[tokio::test]
    async fn test_dom_content_loaded_fires_once_bootstrap_ran() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        doc.inject_bootstrap(
            "document.addEventListener('DOMContentLoaded', () => {\
               const el = document.createElement('span');\
               el.textContent = 'loaded';\
               document.body.appendChild(el);\
             });",
        )
        .unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(html.contains("<span>loaded</span>"));
    }

    #[tokio::test]
    async fn test_console_is_captured_not_printed() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        doc.inject_bootstrap("console.log('hello', {a: 1}); console.warn('careful');")
            .unwrap();
        let console = doc.console_output();
        assert_eq!(console.logs, vec!["hello {\"a\":1}"]);
        assert_eq!(console.warns, vec!["careful"]);
        assert!(console.errors.is_empty());
    }

    #[tokio::test]
    async fn test_script_error_surfaces_as_runtime_error() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        let err = doc.inject_bootstrap("throw new Error('boom');").unwrap_err();
        assert!(matches!(err, RenderError::Runtime(_)));
        assert!(err.to_string().contains("synthetic runtime error"));
    }

    #[tokio::test]
    async fn test_clear_timeout_cancels_only_pending_timers() {
        let mut doc = SyntheticDocument::new(options(SHELL_TEMPLATE)).unwrap();
        doc.inject_bootstrap(
            "const cancelled = setTimeout(() => {\
               const el = document.createElement('i');\
               el.textContent = 'cancelled';\
               document.body.appendChild(el);\
             }, 0);\
             clearTimeout(cancelled);\
             clearTimeout(424242);\
             setTimeout(() => {\
               const el = document.createElement('b');\
               el.textContent = 'fired';\
               document.body.appendChild(el);\
             }, 0);",
        )
        .unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(html.contains("<b>fired</b>"));
        assert!(!html.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_scripts_disabled_skips_execution() {
        let mut opts = options(SHELL_TEMPLATE);
        opts.scripts_enabled = false;
        let mut doc = SyntheticDocument::new(opts).unwrap();
        doc.inject_bootstrap("document.body.appendChild(document.createElement('div'));")
            .unwrap();
        doc.wait_ready().await.unwrap();
        let html = doc.serialize().unwrap();
        assert!(!html.contains("<div>"));
    }
}
