//! CLI entry point for the disk relay service.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{
    Cache, Database, Delivery, Pipeline, ProviderClient, Request, StatsSink, TaskQueue,
    TelegramDelivery, WorkerPool,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

mod cli;
mod config;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::load(args.config.as_deref())?;
    config.apply_overrides(&args);
    config.validate()?;
    debug!(?config, "configuration loaded");

    info!(workers = config.workers, "disk relay starting");

    let cache = Cache::open(&config.cache_path)
        .await
        .context("cache store is unreadable, refusing to start")?;
    let db = Database::new(&config.db_path)
        .await
        .context("failed to open statistics database")?;

    let provider = ProviderClient::new(config.provider_config(), Arc::new(config.throttle()))
        .context("failed to build provider client")?;
    let delivery: Arc<dyn Delivery> = Arc::new(
        TelegramDelivery::new(
            config.delivery_base_url.as_str(),
            config.bot_token.expose(),
            config.connect_timeout(),
            config.read_timeout(),
        )
        .context("failed to build delivery client")?,
    );

    let pipeline = Pipeline::new(
        provider,
        Arc::new(cache),
        StatsSink::new(db.clone()),
        delivery,
        config.pipeline_config(),
    );

    let queue = Arc::new(TaskQueue::new(config.queue_capacity));
    let pool = WorkerPool::start(
        config.workers,
        Arc::clone(&queue),
        Arc::new(pipeline),
        config.retry_policy(),
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let interrupted = tokio::select! {
        result = ingest(stdin, &queue) => {
            let accepted = result.context("failed to read requests from stdin")?;
            info!(accepted, outstanding = queue.outstanding(), "input closed, waiting for outstanding requests");
            tokio::select! {
                () = queue.join() => false,
                _ = tokio::signal::ctrl_c() => true,
            }
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        warn!(
            outstanding = queue.outstanding(),
            "interrupted, finishing in-flight requests"
        );
    }

    let stats = Arc::clone(pool.stats());
    pool.shutdown().await;
    queue.close().await;
    db.close().await;

    info!(
        delivered = stats.delivered(),
        cache_hits = stats.cache_hits(),
        requeued = stats.requeued(),
        dropped = stats.dropped(),
        "disk relay stopped"
    );

    if interrupted {
        // The stdin reader may still be parked on a blocking read, which would
        // keep the runtime from shutting down.
        std::process::exit(130);
    }

    Ok(())
}

/// Enqueues one request per input line until EOF; returns how many were accepted.
async fn ingest<R>(reader: R, queue: &TaskQueue) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request = match line.parse::<Request>() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "skipping malformed request line");
                continue;
            }
        };

        match queue.enqueue(request).await {
            Ok(job_id) => {
                accepted += 1;
                debug!(job_id, "request accepted");
            }
            Err(e) => {
                warn!(error = %e, "queue closed, ignoring remaining input");
                break;
            }
        }
    }

    Ok(accepted)
}
