//! Progress & Accounting (spec §4.8): worker-usage samples accumulated in
//! memory and flushed to `worker_usage.csv` on any termination path, plus
//! the end-of-run report (failed-job table, best-result-per-objective
//! table).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::model::{Direction, Trial, TrialStatus};
use crate::store::RunLayout;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerUsageSample {
    pub time: chrono::DateTime<chrono::Utc>,
    pub outstanding: usize,
    pub parallelism: usize,
    pub percentage: f64,
}

#[derive(Debug, Default)]
pub struct WorkerUsageTracker {
    samples: Vec<WorkerUsageSample>,
}

impl WorkerUsageTracker {
    pub fn record(&mut self, outstanding: usize, parallelism: usize) {
        let percentage = if parallelism == 0 {
            0.0
        } else {
            (outstanding as f64 / parallelism as f64) * 100.0
        };
        self.samples.push(WorkerUsageSample {
            time: chrono::Utc::now(),
            outstanding,
            parallelism,
            percentage,
        });
    }

    /// Flushed on every termination path, not just success (spec §4.8).
    pub fn flush(&self, layout: &RunLayout) -> Result<(), std::io::Error> {
        let mut writer = csv::Writer::from_path(layout.worker_usage_csv())?;
        for sample in &self.samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJobRow {
    pub trial_index: u64,
    pub hostname: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BestResultRow {
    pub result_name: String,
    pub best_value: f64,
    pub trial_index: u64,
}

/// Single pass over the live trial table, tracking the extremum per
/// objective independently of any other computation, matching §4.8's
/// documented best-result behavior exactly rather than re-deriving it
/// from a separately maintained "best so far" value.
pub fn best_result_table(trials: &[Trial], directions: &BTreeMap<String, Direction>) -> Vec<BestResultRow> {
    let mut best: BTreeMap<String, (f64, u64)> = BTreeMap::new();

    for trial in trials {
        if trial.status != TrialStatus::Completed {
            continue;
        }
        for (name, value) in &trial.raw_results {
            let direction = directions.get(name).copied().unwrap_or(Direction::Minimize);
            match best.get(name) {
                Some((current_best, _)) if !direction.is_better(*value, *current_best) => {}
                _ => {
                    best.insert(name.clone(), (*value, trial.index));
                }
            }
        }
    }

    best.into_iter()
        .map(|(result_name, (best_value, trial_index))| BestResultRow {
            result_name,
            best_value,
            trial_index,
        })
        .collect()
}

pub fn failed_job_table(trials: &[Trial]) -> Vec<FailedJobRow> {
    trials
        .iter()
        .filter(|t| t.status == TrialStatus::Failed)
        .map(|t| FailedJobRow {
            trial_index: t.index,
            hostname: t.hostname.clone(),
            exit_code: t.exit_code,
            signal: t.signal,
        })
        .collect()
}

/// Writes the failed-run log pair (spec §3): `headers.csv` carries the
/// trial identity/exit columns, `parameters.csv` carries the arm values,
/// widened to the union of parameter names across every failed trial.
pub fn write_failed_job_tables(layout: &RunLayout, trials: &[Trial]) -> Result<(), std::io::Error> {
    let failed: Vec<&Trial> = trials.iter().filter(|t| t.status == TrialStatus::Failed).collect();

    let mut headers_writer = csv::Writer::from_path(layout.failed_headers_csv())?;
    for row in failed_job_table(trials) {
        headers_writer.serialize(row)?;
    }
    headers_writer.flush()?;

    let mut param_names: BTreeSet<String> = BTreeSet::new();
    for t in &failed {
        param_names.extend(t.arm.keys().cloned());
    }

    let mut params_writer = csv::Writer::from_path(layout.failed_parameters_csv())?;
    let mut header = vec!["trial_index".to_string()];
    header.extend(param_names.iter().cloned());
    params_writer.write_record(&header)?;
    for t in &failed {
        let mut record = vec![t.index.to_string()];
        for name in &param_names {
            record.push(t.arm.get(name).map(|v| v.as_string()).unwrap_or_default());
        }
        params_writer.write_record(&record)?;
    }
    params_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GenerationMethod, ParamValue};

    fn trial(index: u64, status: TrialStatus, score: f64) -> Trial {
        let mut t = Trial::new(index, Default::default(), GenerationMethod::Sobol);
        t.status = status;
        t.arm.insert("x".to_string(), ParamValue::Number(1.0));
        if status == TrialStatus::Completed {
            t.raw_results.insert("score".to_string(), score);
        }
        t
    }

    #[test]
    fn best_result_picks_minimum_for_minimize() {
        let trials = vec![trial(0, TrialStatus::Completed, 5.0), trial(1, TrialStatus::Completed, 2.0)];
        let mut dirs = BTreeMap::new();
        dirs.insert("score".to_string(), Direction::Minimize);
        let rows = best_result_table(&trials, &dirs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].best_value, 2.0);
        assert_eq!(rows[0].trial_index, 1);
    }

    #[test]
    fn best_result_picks_maximum_for_maximize() {
        let trials = vec![trial(0, TrialStatus::Completed, 5.0), trial(1, TrialStatus::Completed, 2.0)];
        let mut dirs = BTreeMap::new();
        dirs.insert("score".to_string(), Direction::Maximize);
        let rows = best_result_table(&trials, &dirs);
        assert_eq!(rows[0].best_value, 5.0);
    }

    #[test]
    fn failed_job_table_lists_only_failed_trials() {
        let trials = vec![trial(0, TrialStatus::Completed, 1.0), trial(1, TrialStatus::Failed, 0.0)];
        let rows = failed_job_table(&trials);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trial_index, 1);
    }

    #[test]
    fn worker_usage_tracks_percentage() {
        let mut tracker = WorkerUsageTracker::default();
        tracker.record(2, 4);
        assert_eq!(tracker.samples[0].percentage, 50.0);
    }
}
