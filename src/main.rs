use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paper_harvester::HarvestError;
use paper_harvester::cli::{Cli, Command};
use paper_harvester::config::HarvestConfig;
use paper_harvester::orchestrator::{CollectionEvent, CollectionOrchestrator, CollectionReport};
use paper_harvester::recovery::InterruptionRecoverySystem;
use paper_harvester::session::{FsStore, SessionStateManager};
use paper_harvester::shutdown::Shutdown;
use paper_harvester::source::HttpCollector;
use paper_harvester::ui::{self, RunProgress};
use paper_harvester::work::WorkPlan;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = HarvestConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
        config.validate()?;
    }
    let config = Arc::new(config);

    match cli.command {
        Command::Start {
            sources,
            domains,
            years,
        } => {
            let years = years.map(|r| r.years()).unwrap_or_default();
            let plan = WorkPlan::grid(&sources, &domains, &years)?;
            let units = plan.len() as u64;
            let (tx, rx) = mpsc::unbounded_channel();
            let orchestrator = build_orchestrator(&config)?.with_events(tx);
            watch_ctrl_c(orchestrator.shutdown_handle());
            let pump = spawn_progress(units, rx);

            let result = orchestrator.start_collection(plan).await;
            drop(orchestrator);
            let _ = pump.await;
            print_outcome(result)?;
        }
        Command::Resume { session_id } => {
            let sessions = SessionStateManager::from_config(&config);
            let counts = sessions.session(&session_id)?.counts();
            let units = (counts.pending + counts.in_progress) as u64;

            let (tx, rx) = mpsc::unbounded_channel();
            let orchestrator = build_orchestrator(&config)?.with_events(tx);
            watch_ctrl_c(orchestrator.shutdown_handle());
            let pump = spawn_progress(units, rx);

            let result = orchestrator.resume_collection(&session_id).await;
            drop(orchestrator);
            let _ = pump.await;
            print_outcome(result)?;
        }
        Command::Status { session_id } => {
            let orchestrator = build_orchestrator(&config)?;
            ui::print_status(&orchestrator.get_status(&session_id)?);
        }
        Command::Validate { session_id } => {
            let sessions = Arc::new(SessionStateManager::from_config(&config));
            let recovery = InterruptionRecoverySystem::new(sessions, &config);
            let report = recovery.validate_recovery(&session_id)?;
            let recommendations = recovery.generate_recommendations(&report);
            ui::print_recovery(&report, &recommendations);
        }
        Command::Requeue { session_id } => {
            let sessions = SessionStateManager::from_config(&config);
            let requeued = sessions.requeue_failed(&session_id)?;
            println!("Re-queued {requeued} failed unit(s) in {session_id}");
        }
        Command::Sessions => {
            let sessions = SessionStateManager::from_config(&config);
            ui::print_sessions(&sessions.list_sessions()?);
        }
        Command::Cleanup {
            max_age_days,
            keep_last,
            include_incomplete,
        } => {
            let mut policy = config.retention.clone();
            if max_age_days.is_some() {
                policy.max_age_days = max_age_days;
            }
            if keep_last.is_some() {
                policy.keep_last = keep_last;
            }
            policy.include_incomplete |= include_incomplete;

            let sessions = SessionStateManager::from_config(&config);
            let removed = sessions.cleanup_old_sessions(&policy)?;
            for id in &removed {
                println!("removed {id}");
            }
            println!("Removed {} session(s)", removed.len());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// One HTTP collector per configured source with a `base_url`.
fn build_orchestrator(config: &Arc<HarvestConfig>) -> Result<CollectionOrchestrator<HttpCollector>> {
    let mut adapters = HashMap::new();
    for (name, source) in &config.sources {
        match HttpCollector::from_config(source)? {
            Some(collector) => {
                adapters.insert(name.clone(), collector);
            }
            None => warn!(source = %name, "no base_url configured, source disabled"),
        }
    }
    info!(sources = adapters.len(), "collectors ready");
    Ok(CollectionOrchestrator::new(
        Arc::clone(config),
        adapters,
        FsStore::new(&config.state_dir),
    ))
}

fn watch_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight units finish");
            shutdown.trigger();
        }
    });
}

/// Drive a progress bar until every event sender is dropped.
fn spawn_progress(units: u64, mut rx: mpsc::UnboundedReceiver<CollectionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let progress = RunProgress::start(units);
        while let Some(event) = rx.recv().await {
            progress.handle(&event);
        }
        progress.finish();
    })
}

fn print_outcome(result: paper_harvester::Result<CollectionReport>) -> Result<()> {
    match result {
        Ok(report) => {
            ui::print_report(&report);
            Ok(())
        }
        Err(err) => {
            if let HarvestError::DataIntegrity {
                recommendations, ..
            } = &err
            {
                for line in recommendations {
                    eprintln!("  → {line}");
                }
            }
            Err(err.into())
        }
    }
}
