mod handlers;

use std::sync::Arc;

use anyhow::Context;
use collectq_infra::connection::{ConnectionDescriptor, ConnectionGuard, GuardError, PgConnector};
use collectq_infra::db;
use collectq_infra::heartbeat::PostgresHeartbeatStore;
use collectq_infra::jobs::PostgresJobStore;
use collectq_infra::reaper::{ReaperError, StuckJobReaper};
use collectq_infra::worker::{WorkerError, WorkerRuntime};
use collectq_infra::{ConfigError, QueueConfig, ShutdownSignal};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    collectq_observability::init();

    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            let code = exit_code(&err);
            error!(exit_code = code, error = %format!("{err:#}"), "collectq worker exiting");
            code
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let cfg = QueueConfig::from_env()?;
    let descriptor = ConnectionDescriptor::from_env()?;

    let connector = PgConnector {
        max_connections: cfg.db_max_connections,
        ..PgConnector::default()
    };
    let pool = ConnectionGuard::new(connector, descriptor).acquire().await?;
    db::migrate(&pool)
        .await
        .context("applying schema migrations")?;

    let jobs = Arc::new(
        PostgresJobStore::new(pool.clone()).with_max_attempts(cfg.default_max_attempts),
    );
    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown.trigger();
        });
    }

    let reaper = Arc::new(StuckJobReaper::new(jobs.clone(), cfg.reaper_config()));
    info!(role = %cfg.role, "collectq starting");

    if !cfg.role.runs_worker() {
        reaper.run(shutdown).await?;
        info!(recovered = reaper.recovered_total(), "collectq reaper stopped");
        return Ok(());
    }

    // A failing reaper takes the worker down with it so the supervisor sees it.
    let reaper_task = cfg.role.runs_reaper().then(|| {
        let reaper = reaper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let outcome = reaper.run(shutdown.clone()).await;
            if outcome.is_err() {
                shutdown.trigger();
            }
            outcome
        })
    });

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let runtime = WorkerRuntime::new(
        cfg.worker_config(&host),
        jobs,
        Arc::new(PostgresHeartbeatStore::new(pool)),
        handlers::registry(),
    );
    let outcome = runtime.run(shutdown.clone()).await;

    shutdown.trigger();
    let reaped = match reaper_task {
        Some(task) => task.await.context("reaper task ended abnormally")?,
        None => Ok(()),
    };

    let stats = outcome?;
    reaped?;
    info!(
        worker_id = %runtime.worker_id(),
        cycles = stats.cycles,
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        recovered = reaper.recovered_total(),
        "collectq worker stopped"
    );
    Ok(())
}

/// Exit code for supervisors: 78 for configuration, 2 for auth, 3 for a crash
/// loop, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        78
    } else if let Some(e) = err.downcast_ref::<GuardError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<WorkerError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<ReaperError>() {
        e.exit_code()
    } else {
        1
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, draining"),
        _ = terminate => info!("received SIGTERM, draining"),
    }
}
