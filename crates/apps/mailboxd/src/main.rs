//! mailboxd - HTTP server for the multi-tenant mailbox
//!
//! Loads configuration, wires the mailbox service and serves the API until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use mailbox::{MailboxConfig, MailboxService, api};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "mailboxd", about = "Multi-tenant mailbox HTTP server")]
struct Args {
    /// JSON config file; defaults to mailbox.json in the config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configured one
    #[arg(long)]
    listen: Option<String>,

    /// Rebuild the search index from the database before serving
    #[arg(long)]
    rebuild_index: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    if args.config.is_none() {
        match config::config_dir() {
            Some(dir) => info!(
                "Looking for {} in {}",
                mailbox::config::CONFIG_FILE,
                dir.display()
            ),
            None => warn!("Could not determine config directory, using defaults"),
        }
    }

    let mut cfg = MailboxConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    let listen_addr = cfg.listen_addr.clone();
    let rebuild_index = args.rebuild_index;

    // Opening the database and index is blocking work
    let service = tokio::task::spawn_blocking(move || {
        let service = MailboxService::from_config(&cfg)?;
        if rebuild_index {
            service.rebuild_search_index()?;
        }
        Ok::<_, anyhow::Error>(service)
    })
    .await
    .context("Startup task failed")??;

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    api::serve(listener, Arc::new(service), async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
    })
    .await
}
