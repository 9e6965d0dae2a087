//! `raveld` — the dispatcher daemon (`spec.md` §4.3, §4.4).
//!
//! Grounded in the teacher's `crates/slurmletd/src/main.rs`: daemonize
//! first (before any tokio runtime exists — `daemonize` forks the process),
//! then set up a `non_blocking` writer + `EnvFilter`, then hand off to the
//! async runtime. The teacher builds its `tracing_subscriber::fmt::Subscriber`
//! directly; this keeps that shape but derives the filter from `RUST_LOG`
//! (falling back to `info`) instead of a TOML `log_level` string, since this
//! spec has no config file.
//!
//! `daemon::daemonize` already dup2'd the process's stdout/stderr onto
//! `STATE_DIR/daemon.log` (`spec.md` §6: the state directory's documented
//! `daemon.log` file). Tracing is therefore pointed at `std::io::stdout()`,
//! not a separately named/rolled file — otherwise the daemon's structured
//! logs would land somewhere other than the one file the contract promises.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ravel::config::Config;
use ravel::daemon;
use ravel::dispatcher::Dispatcher;
use ravel::store::Store;

fn main() -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    daemon::daemonize(&config).context("failed to daemonize")?;

    let (non_blocking_appender, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(non_blocking_appender)
        .with_env_filter(filter)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!(state_dir = ?config.state_dir, max_workers = config.max_workers, "raveld starting");

    let store = Store::open(&config.db_path).context("opening job store")?;
    let dispatcher = Dispatcher::new(store, config);

    let wake = Arc::new(Notify::new());
    let shutdown = Arc::new(Notify::new());

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_signal.notify_one();
        }
    });

    #[cfg(unix)]
    {
        let shutdown_signal = shutdown.clone();
        tokio::spawn(async move {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            term.recv().await;
            shutdown_signal.notify_one();
        });
    }

    dispatcher.run(wake, shutdown).await?;
    info!("raveld shut down cleanly");
    Ok(())
}
