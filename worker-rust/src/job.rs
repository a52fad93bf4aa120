//! Job input and report output, both JSON on disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docking_core::reference::{RunOutcome, Trajectory};
use docking_core::{ControllerConfig, SimulationConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// `population[island][individual]` weight vectors. When absent, a
    /// random population of `islands × individuals` is generated.
    #[serde(default)]
    pub population: Option<Vec<Vec<Vec<f64>>>>,
    #[serde(default = "default_islands")]
    pub islands: usize,
    #[serde(default = "default_individuals")]
    pub individuals: usize,
    /// Fixed starting conditions used for every round instead of sampling.
    #[serde(default)]
    pub starting_conditions: Option<Vec<Vec<f64>>>,
}

fn default_rounds() -> usize {
    1
}

fn default_islands() -> usize {
    1
}

fn default_individuals() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub island: usize,
    pub individual: usize,
    pub fitness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: usize,
    pub seed: u64,
    pub fitness: Vec<Vec<f64>>,
    pub best: Option<Candidate>,
    pub mean: f64,
    pub elapsed_secs: f64,
    /// Largest |batched - reference| when the round was verified.
    #[serde(default)]
    pub max_divergence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: String,
    pub path: String,
    pub backend: String,
    pub fitness_variant: String,
    pub controller: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rounds: Vec<RoundReport>,
    #[serde(default)]
    pub interrupted: bool,
}

impl JobReport {
    pub fn new(path: &str, backend: &str, job: &Job, controller: String) -> Self {
        JobReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            backend: backend.to_string(),
            fitness_variant: job.simulation.fitness.to_string(),
            controller,
            started_at: Utc::now(),
            completed_at: None,
            rounds: Vec::new(),
            interrupted: false,
        }
    }

    /// Best candidate over all rounds.
    pub fn best(&self) -> Option<&Candidate> {
        self.rounds
            .iter()
            .filter_map(|r| r.best.as_ref())
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
    }
}

/// Every run of the best candidate, with trajectories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    pub run_id: String,
    pub candidate: Candidate,
    pub runs: Vec<TracedRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedRun {
    pub outcome: RunOutcome,
    pub trajectory: Trajectory,
}

pub async fn load_job(path: &Path) -> Result<Job> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading job {}", path.display()))?;
    let job: Job = serde_json::from_str(&data).with_context(|| format!("parsing job {}", path.display()))?;
    Ok(job)
}

pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docking_core::FitnessVariant;

    #[tokio::test]
    async fn test_load_minimal_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        tokio::fs::write(&path, r#"{"rounds": 3, "simulation": {"fitness": "twodee2"}}"#)
            .await
            .unwrap();

        let job = load_job(&path).await.unwrap();
        assert_eq!(job.rounds, 3);
        assert_eq!(job.simulation.fitness, FitnessVariant::Twodee2);
        assert_eq!(job.simulation.starting_conditions, 5);
        assert_eq!(job.controller.hidden, vec![10]);
        assert!(job.population.is_none());
        assert_eq!(job.individuals, 16);
    }

    #[tokio::test]
    async fn test_bad_job_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = load_job(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[tokio::test]
    async fn test_report_written_to_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/reports/report.json");
        let job: Job = serde_json::from_str("{}").unwrap();
        let mut report = JobReport::new("batch", "serial", &job, "6→10→3".into());
        for (round, f) in [-0.4, -0.7].into_iter().enumerate() {
            report.rounds.push(RoundReport {
                round,
                seed: round as u64,
                fitness: vec![vec![f]],
                best: Some(Candidate { island: 0, individual: 0, fitness: f }),
                mean: f,
                elapsed_secs: 0.0,
                max_divergence: None,
            });
        }
        assert_eq!(report.best().unwrap().fitness, -0.7);

        save_json(&path, &report).await.unwrap();
        let back: JobReport = serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(back.run_id, report.run_id);
        assert_eq!(back.rounds.len(), 2);
        assert_eq!(back.fitness_variant, "minimal_distance");
    }
}
