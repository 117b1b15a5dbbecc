use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use prerender::assets::AssetStore;
use prerender::dispatch::PageRender;
use prerender::server;
use prerender::{AppSource, SiteConfig};

#[derive(Parser)]
#[command(name = "prerender", about = "Server-side prerenderer for single-page applications")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the site over HTTP, prerendering pages per request.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        #[command(flatten)]
        site: SiteArgs,
    },
    /// Render a single page to stdout and exit.
    Render {
        /// Request path to render.
        #[arg(long, default_value = "/")]
        path: String,
        #[command(flatten)]
        site: SiteArgs,
    },
}

#[derive(Args)]
struct SiteArgs {
    /// Directory holding the built site (index.html and assets/).
    site_dir: PathBuf,

    /// Origin the synthetic window reports; defaults to http://<addr>/.
    #[arg(long)]
    base_url: Option<String>,

    /// Bundle the application from this entry file with esbuild instead of
    /// picking up a prebuilt bundle from the assets directory.
    #[arg(long)]
    entry: Option<PathBuf>,

    /// Per-render deadline in milliseconds; 0 disables the deadline.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Extra origin the sandboxed fetch may reach; repeatable.
    #[arg(long = "allow-origin")]
    allowed_origins: Vec<String>,

    /// Reject all network fetches from the rendered application.
    #[arg(long)]
    no_external_fetch: bool,
}

impl SiteArgs {
    fn into_config(self, default_base: &str) -> SiteConfig {
        SiteConfig {
            site_dir: self.site_dir,
            base_url: self.base_url.unwrap_or_else(|| default_base.to_string()),
            source: match self.entry {
                Some(entry) => AppSource::Entry { entry },
                None => AppSource::Prebuilt,
            },
            render_timeout_ms: (self.timeout_ms > 0).then_some(self.timeout_ms),
            allowed_origins: self.allowed_origins,
            load_external_resources: !self.no_external_fetch,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr, site } => {
            let config = site.into_config(&format!("http://{addr}/"));
            server::serve(addr, config).await
        }
        Command::Render { path, site } => {
            let config = site.into_config("http://localhost:8080/");
            render_once(config, &path).await
        }
    }
}

/// One-shot render for debugging a deployment without serving it.
async fn render_once(config: SiteConfig, path: &str) -> Result<()> {
    let assets = Arc::new(AssetStore::load(&config.site_dir).with_context(|| {
        format!("failed to load site assets from {}", config.site_dir.display())
    })?);
    let handle = server::spawn_render_worker(config, assets)?;
    let html = handle.render_page(path).await?;
    println!("{html}");
    Ok(())
}
