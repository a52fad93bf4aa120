use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub job_path: PathBuf,
    pub report_path: PathBuf,
    pub backend: String,
    /// Evaluate with the reference evaluator instead of the batched stages.
    pub reference: bool,
    /// Cross-check every batched round against the reference evaluator.
    pub verify: bool,
    pub seed: u64,
    pub trace_best: Option<PathBuf>,
}
