//! Observe a directory tree and print each batch as JSON lines.
//!
//! Usage: cargo run -p codex-tree-observer --example observe -- <dir> [config.toml]
//!
//! Set `RUST_LOG=codex_tree_observer=debug` to see settle progress.

use std::path::PathBuf;

use anyhow::Context;
use codex_tree_observer::{ObserverConfig, TreeObserver};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let root = PathBuf::from(args.next().context("usage: observe <dir> [config.toml]")?);

    let config = match args.next() {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            ObserverConfig::from_toml_str(&raw)?
        }
        None => ObserverConfig::default(),
    };

    let (observer, mut batches) = TreeObserver::with_channel(&root, config)?;
    observer.start().await?;
    println!(
        "watching {} directories under {} (ctrl-c to stop)",
        observer.observed_directories().await.len(),
        observer.root().display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            batch = batches.recv() => {
                let Some(batch) = batch else { break };
                for event in batch {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
    }

    observer.stop().await;
    Ok(())
}
