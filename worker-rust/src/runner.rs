//! Blocking evaluation of one job, round by round.

use anyhow::{bail, Context, Result};
use docking_core::{Backend, BatchEvaluator, EvaluationRound, Perceptron, ReferenceEvaluator};
use std::time::Instant;

use crate::config::Config;
use crate::job::{Candidate, Job, RoundReport, TraceReport, TracedRun};

pub struct Runner {
    job: Job,
    seed: u64,
    verify: bool,
    population: Vec<Vec<Vec<f64>>>,
    reference: ReferenceEvaluator<Perceptron>,
    /// `None` when running on the reference path.
    batch: Option<BatchEvaluator<Perceptron>>,
}

impl Runner {
    pub fn new(job: Job, cfg: &Config, backend: Backend) -> Result<Self> {
        job.simulation.validate().context("invalid simulation config")?;
        job.controller.validate().context("invalid controller config")?;
        if job.rounds == 0 {
            bail!("job has no rounds");
        }

        let perceptron = Perceptron::docking(&job.controller);
        let population = match &job.population {
            Some(pop) => pop.clone(),
            None => (0..job.islands)
                .map(|i| {
                    (0..job.individuals)
                        .map(|j| perceptron.random_init(cfg.seed.wrapping_add((i * job.individuals + j + 1) as u64)))
                        .collect()
                })
                .collect(),
        };

        let reference = ReferenceEvaluator::new(job.simulation.clone(), perceptron.clone())?;
        let batch = if cfg.reference {
            None
        } else {
            Some(BatchEvaluator::new(job.simulation.clone(), perceptron, backend)?)
        };

        Ok(Runner {
            job,
            seed: cfg.seed,
            verify: cfg.verify,
            population,
            reference,
            batch,
        })
    }

    pub fn rounds(&self) -> usize {
        self.job.rounds
    }

    pub fn path(&self) -> &'static str {
        if self.batch.is_some() {
            "batch"
        } else {
            "reference"
        }
    }

    pub fn arch_string(&self) -> String {
        self.reference.controller().arch_string()
    }

    fn round_seed(&self, round: usize) -> u64 {
        self.seed.wrapping_add(round as u64)
    }

    pub fn evaluation_round(&self, round: usize) -> Result<EvaluationRound> {
        match &self.job.starting_conditions {
            Some(conditions) => Ok(EvaluationRound::from_conditions(conditions)?),
            None => Ok(EvaluationRound::seeded(self.job.simulation.starting_conditions, self.round_seed(round))),
        }
    }

    pub fn run_round(&mut self, round: usize) -> Result<RoundReport> {
        let start = Instant::now();
        let eval_round = self.evaluation_round(round)?;

        let fitness = match self.batch.as_mut() {
            Some(batch) => batch
                .evaluate(&self.population, &eval_round)
                .with_context(|| format!("batched evaluation of round {round}"))?,
            None => self
                .population
                .iter()
                .map(|island| self.reference.evaluate_population(island, &eval_round))
                .collect::<docking_core::Result<Vec<_>>>()
                .with_context(|| format!("reference evaluation of round {round}"))?,
        };

        let max_divergence = if self.verify && self.batch.is_some() {
            let mut worst: f64 = 0.0;
            for (island, row) in self.population.iter().zip(&fitness) {
                let expected = self.reference.evaluate_population(island, &eval_round)?;
                for (a, b) in row.iter().zip(&expected) {
                    worst = worst.max((a - b).abs());
                }
            }
            if worst > 0.0 {
                tracing::warn!(round, divergence = worst, "batched fitness differs from reference");
            } else {
                tracing::debug!(round, "batched fitness matches reference");
            }
            Some(worst)
        } else {
            None
        };

        let best = fitness
            .iter()
            .enumerate()
            .flat_map(|(island, row)| {
                row.iter().enumerate().map(move |(individual, &f)| Candidate { island, individual, fitness: f })
            })
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness));
        let all: Vec<f64> = fitness.iter().flatten().copied().collect();
        let mean = if all.is_empty() {
            0.0
        } else {
            all.iter().sum::<f64>() / all.len() as f64
        };

        Ok(RoundReport {
            round,
            seed: self.round_seed(round),
            fitness,
            best,
            mean,
            elapsed_secs: start.elapsed().as_secs_f64(),
            max_divergence,
        })
    }

    /// Re-runs `candidate` on the reference path with trajectories recorded.
    pub fn trace(&self, run_id: &str, candidate: &Candidate, round: usize) -> Result<TraceReport> {
        let weights = self
            .population
            .get(candidate.island)
            .and_then(|island| island.get(candidate.individual))
            .with_context(|| format!("no candidate {}/{}", candidate.island, candidate.individual))?;
        let runs = self
            .reference
            .trace(weights, &self.evaluation_round(round)?)?
            .into_iter()
            .map(|(outcome, trajectory)| TracedRun { outcome, trajectory })
            .collect();
        Ok(TraceReport { run_id: run_id.to_string(), candidate: candidate.clone(), runs })
    }
}
