mod config;
mod job;
mod runner;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use docking_core::Backend;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docking-worker", about = "Evaluate docking controllers for a population job")]
struct Cli {
    /// Job file (JSON)
    #[arg(long, env = "DOCKING_JOB")]
    job: PathBuf,

    /// Where to write the report
    #[arg(long, env = "DOCKING_REPORT", default_value = "report.json")]
    report: PathBuf,

    /// Execution backend: serial, rayon, cuda or auto
    #[arg(long, env = "DOCKING_BACKEND", default_value = "auto")]
    backend: String,

    /// Use the single-candidate reference evaluator instead of the batched stages
    #[arg(long, default_value = "false")]
    reference: bool,

    /// Check every batched round against the reference evaluator
    #[arg(long, default_value = "false")]
    verify: bool,

    /// Seed for starting conditions and generated populations
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Write trajectories of the best candidate to this file
    #[arg(long)]
    trace_best: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        job_path: cli.job,
        report_path: cli.report,
        backend: cli.backend,
        reference: cli.reference,
        verify: cli.verify,
        seed: cli.seed,
        trace_best: cli.trace_best,
    };

    let job = job::load_job(&cfg.job_path).await?;
    let backend = Backend::from_name(&cfg.backend).context("selecting backend")?;
    let mut runner = runner::Runner::new(job.clone(), &cfg, backend.clone())?;
    let mut report = job::JobReport::new(runner.path(), backend.name(), &job, runner.arch_string());

    tracing::info!(
        run_id = %report.run_id,
        path = runner.path(),
        backend = backend.name(),
        controller = %report.controller,
        fitness = %report.fitness_variant,
        rounds = runner.rounds(),
        "Starting evaluation"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    for round in 0..runner.rounds() {
        if *shutdown_rx.borrow() {
            tracing::info!(round, "Shutting down before next round");
            report.interrupted = true;
            break;
        }

        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = runner.run_round(round);
            (runner, result)
        })
        .await
        .context("evaluation task panicked")?;
        runner = returned;

        let round_report = result?;
        tracing::info!(
            round,
            mean = round_report.mean,
            best = ?round_report.best.as_ref().map(|b| b.fitness),
            elapsed = %format!("{:.2}s", round_report.elapsed_secs),
            "Round evaluated"
        );
        report.rounds.push(round_report);
        job::save_json(&cfg.report_path, &report).await?;
    }

    report.completed_at = Some(chrono::Utc::now());
    job::save_json(&cfg.report_path, &report).await?;
    if let Some(best) = report.best() {
        tracing::info!(island = best.island, individual = best.individual, fitness = best.fitness, "Best candidate");
    }
    tracing::info!(report = %cfg.report_path.display(), "Report written");

    if let Some(path) = &cfg.trace_best {
        let best = report
            .rounds
            .iter()
            .filter_map(|r| r.best.as_ref().map(|b| (r.round, b)))
            .min_by(|a, b| a.1.fitness.total_cmp(&b.1.fitness));
        match best {
            Some((round, candidate)) => {
                let trace = runner.trace(&report.run_id, candidate, round)?;
                job::save_json(path, &trace).await?;
                tracing::info!(
                    island = candidate.island,
                    individual = candidate.individual,
                    trace = %path.display(),
                    "Best candidate traced"
                );
            }
            None => tracing::warn!("No evaluated candidate to trace"),
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
