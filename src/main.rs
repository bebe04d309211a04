use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use got::cli::{ClientOpts, Command};
use got::client::{until_cancelled, Client};
use got::url::parse_addr;

fn main() {
    let interrupt = CancellationToken::new();
    let on_signal = interrupt.clone();
    ctrlc::set_handler(move || {
        // A second Ctrl-C skips cleanup.
        if on_signal.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted by user. Cleaning up (Ctrl-C again to force)...");
        on_signal.cancel();
    })
    .unwrap_or_else(|e| eprintln!("warning: no Ctrl-C handler: {e}"));

    let opts = ClientOpts::parse();
    match run(opts, &interrupt) {
        Ok(true) => {}
        Ok(false) => std::process::exit(130),
        Err(e) => {
            eprintln!("got: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `false` when interrupted; the operation has been dropped and
/// the runtime shut down by then.
fn run(opts: ClientOpts, interrupt: &CancellationToken) -> Result<bool> {
    let addr = parse_addr(&opts.addr)
        .with_context(|| format!("invalid server address {:?}", opts.addr))?;
    let client = Client::new(addr.to_string()).quiet(opts.quiet);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let start = Instant::now();
    let finished = rt.block_on(until_cancelled(interrupt, async {
        match &opts.command {
            Command::List => {
                let info = client.list_files().await.context("list")?;
                println!("{}", info);
            }
            Command::Change { dir } => {
                let info = client
                    .change_dir(dir)
                    .await
                    .with_context(|| format!("change to {}", dir))?;
                println!("{}", info);
            }
            Command::Upload { path } => {
                client
                    .upload_file(path)
                    .await
                    .with_context(|| format!("upload {}", path.display()))?;
            }
            Command::Download { path } => {
                client
                    .download_file(path)
                    .await
                    .with_context(|| format!("download {}", path))?;
            }
        }
        Ok::<(), anyhow::Error>(())
    }));
    drop(rt);
    match finished {
        Some(done) => done?,
        None => return Ok(false),
    }

    if opts.time {
        println!("time cost: {:.2?}", start.elapsed());
    }
    Ok(true)
}
