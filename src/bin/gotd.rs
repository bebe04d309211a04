use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use got::cli::DaemonOpts;
use got::logger::{JournalLogger, Logger, StderrLogger, TextLogger};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    if !opts.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", opts.root.display());
    }
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    let logger: Arc<dyn Logger> = if let Some(ref p) = opts.log_file {
        Arc::new(TextLogger::new(p)?)
    } else if let Some(ref p) = opts.journal {
        Arc::new(JournalLogger::new(p)?)
    } else {
        Arc::new(StderrLogger)
    };

    let bind = opts.bind_addr();
    println!("Starting got daemon:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", bind);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(got::server::serve(&bind, &canonical_root, logger))
        .with_context(|| format!("failed to serve on {}", bind))
}
