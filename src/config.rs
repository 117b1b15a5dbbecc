//! Render and serving configuration.

use std::path::PathBuf;

/// Where the application's executable bundle comes from.
#[derive(Debug, Clone)]
pub enum AppSource {
    /// A built site: `index.html` shell plus an assets directory containing
    /// the entry bundle under a fixed filename convention. The bundle is
    /// located fresh per render.
    Prebuilt,
    /// A source entry point handed to the external bundler. The entry is
    /// immutable for the process lifetime, so the bundle may be cached
    /// process-wide.
    Entry { entry: PathBuf },
}

/// Configuration for one render target (a site served by this process).
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Directory holding `index.html` and the static asset tree.
    pub site_dir: PathBuf,
    /// Serving origin, used as the synthetic window's base URL
    /// (e.g. "http://localhost:8080").
    pub base_url: String,
    pub source: AppSource,
    /// Asset subdirectory searched for the main bundle (prebuilt mode).
    pub assets_dir: String,
    /// Filename convention for the main bundle: `{prefix}*{suffix}`.
    pub bundle_prefix: String,
    pub bundle_suffix: String,
    /// Deadline for a single render. `None` disables the watchdog, which
    /// leaves a stalled document suspended forever.
    pub render_timeout_ms: Option<u64>,
    /// V8 heap cap in bytes. `None` = unlimited.
    pub max_heap_size: Option<usize>,
    /// Extra origins the application may fetch from during a render; the
    /// serving origin itself is always allowed.
    pub allowed_origins: Vec<String>,
    /// Disabling this turns in-render `fetch` into a rejection.
    pub load_external_resources: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_dir: PathBuf::from("./dist"),
            base_url: String::from("http://localhost:8080"),
            source: AppSource::Prebuilt,
            assets_dir: String::from("assets"),
            bundle_prefix: String::from("index-"),
            bundle_suffix: String::from(".js"),
            render_timeout_ms: Some(10_000),
            max_heap_size: Some(64 * 1024 * 1024),
            allowed_origins: vec![],
            load_external_resources: true,
        }
    }
}

impl SiteConfig {
    /// Path of the on-disk HTML shell, if the deployment ships one.
    pub fn shell_path(&self) -> PathBuf {
        self.site_dir.join("index.html")
    }
}
