//! Experiment Store (spec §4.1): the single writer of run state. Every
//! trial transition and every snapshot passes through here so the rest of
//! the crate never touches the filesystem directly.

pub mod counters;
pub mod layout;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::OrchestratorError;
use crate::model::{Arm, GenerationMethod, IndexAllocator, Trial, TrialStatus};
use crate::paramspace::ParameterSpace;

pub use counters::CounterFile;
pub use layout::RunLayout;
pub use snapshot::ExperimentSnapshot;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct ExperimentStore {
    layout: RunLayout,
    run_uuid: String,
    continued_from: Option<String>,
    allocator: IndexAllocator,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    parameter_space: ParameterSpace,
    trials: BTreeMap<u64, Trial>,
}

impl ExperimentStore {
    /// Creates a brand-new run folder with its fixed set of marker files
    /// (spec §4.1: `run_uuid`, `global_vars.json`, `environment` snapshot).
    pub async fn create(
        layout: RunLayout,
        run_uuid: String,
        parameter_space: ParameterSpace,
    ) -> Result<Self, OrchestratorError> {
        tokio::fs::create_dir_all(layout.state_files_dir())
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
        tokio::fs::create_dir_all(layout.single_runs_dir())
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
        tokio::fs::create_dir_all(layout.failed_logs_dir())
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
        tokio::fs::write(layout.run_uuid_file(), &run_uuid)
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

        let store = Self {
            layout,
            run_uuid,
            continued_from: None,
            allocator: IndexAllocator::starting_at(0),
            inner: Mutex::new(StoreInner {
                parameter_space,
                trials: BTreeMap::new(),
            }),
        };
        store.snapshot().await?;
        Ok(store)
    }

    /// Reopens a previous run folder, resuming trial indices from the
    /// snapshot's high-water mark (spec §4.3).
    pub async fn load_from(layout: RunLayout, continued_from_run: String) -> Result<Self, OrchestratorError> {
        if !layout.exists() {
            return Err(OrchestratorError::ContinuationFolderMissing(layout.root().display().to_string()));
        }
        let contents = tokio::fs::read_to_string(layout.experiment_snapshot())
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
        let snapshot = ExperimentSnapshot::from_json(&contents)
            .map_err(|e| OrchestratorError::ConfigParse(format!("corrupt experiment snapshot: {e}")))?;

        let trials = snapshot
            .trials
            .into_iter()
            .map(|t| (t.index, t))
            .collect::<BTreeMap<_, _>>();
        let allocator = IndexAllocator::starting_at(snapshot.next_trial_index);
        tokio::fs::write(layout.uuid_of_continued_run_file(), &continued_from_run)
            .await
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

        Ok(Self {
            layout,
            run_uuid: snapshot.run_uuid,
            continued_from: Some(continued_from_run),
            allocator,
            inner: Mutex::new(StoreInner {
                parameter_space: snapshot.parameter_space,
                trials,
            }),
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn allocator(&self) -> &IndexAllocator {
        &self.allocator
    }

    pub async fn parameter_space(&self) -> ParameterSpace {
        self.inner.lock().await.parameter_space.clone()
    }

    /// Replaces the declared parameter space, e.g. after applying
    /// bound-widening on continuation (spec §4.2), and persists the change.
    pub async fn set_parameter_space(&self, space: ParameterSpace) -> Result<(), OrchestratorError> {
        self.ensure_run_folder_present().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.parameter_space = space;
        }
        self.snapshot().await
    }

    pub async fn trial_count(&self) -> usize {
        self.inner.lock().await.trials.len()
    }

    pub async fn trials_snapshot(&self) -> Vec<Trial> {
        self.inner.lock().await.trials.values().cloned().collect()
    }

    /// Registers a new trial produced by a trial source (spec §4.1
    /// `AttachTrial`). The index is expected to already have been drawn
    /// from the shared allocator by the caller.
    pub async fn attach_trial(&self, index: u64, arm: Arm, method: GenerationMethod) -> Result<(), OrchestratorError> {
        self.ensure_run_folder_present().await?;
        let mut inner = self.inner.lock().await;
        let mut trial = Trial::new(index, arm, method);
        trial.status = TrialStatus::Staged;
        inner.trials.insert(index, trial);
        drop(inner);
        self.snapshot().await
    }

    pub async fn mark_running(&self, index: u64, hostname: Option<String>) -> Result<(), OrchestratorError> {
        self.ensure_run_folder_present().await?;
        let mut inner = self.inner.lock().await;
        let trial = inner
            .trials
            .get_mut(&index)
            .ok_or(OrchestratorError::UnknownTrial(index))?;
        if !trial.status.can_transition_to(TrialStatus::Running) {
            return Err(OrchestratorError::InvalidTransition(index));
        }
        trial.status = TrialStatus::Running;
        trial.hostname = hostname;
        trial.start_time = Some(Utc::now());
        Ok(())
    }

    pub async fn complete_trial(
        &self,
        index: u64,
        raw_results: BTreeMap<String, f64>,
        exit_code: Option<i32>,
    ) -> Result<(), OrchestratorError> {
        self.transition(index, TrialStatus::Completed, |trial| {
            trial.raw_results = raw_results;
            trial.exit_code = exit_code;
        })
        .await
    }

    pub async fn fail_trial(&self, index: u64, exit_code: Option<i32>, signal: Option<i32>) -> Result<(), OrchestratorError> {
        self.transition(index, TrialStatus::Failed, |trial| {
            trial.exit_code = exit_code;
            trial.signal = signal;
        })
        .await
    }

    pub async fn abandon_trial(&self, index: u64) -> Result<(), OrchestratorError> {
        self.transition(index, TrialStatus::Abandoned, |_| {}).await
    }

    async fn transition(
        &self,
        index: u64,
        target: TrialStatus,
        mutate: impl FnOnce(&mut Trial),
    ) -> Result<(), OrchestratorError> {
        self.ensure_run_folder_present().await?;
        {
            let mut inner = self.inner.lock().await;
            let trial = inner
                .trials
                .get_mut(&index)
                .ok_or(OrchestratorError::UnknownTrial(index))?;
            if !trial.status.can_transition_to(target) {
                return Err(OrchestratorError::InvalidTransition(index));
            }
            trial.status = target;
            trial.end_time = Some(Utc::now());
            mutate(trial);
        }
        self.snapshot().await
    }

    /// Full-rewrite snapshot to both copies, retried up to
    /// [`WRITE_RETRIES`] times on transient I/O errors (spec §4.1). A
    /// disk-full error bypasses the retry and is fatal immediately. Also
    /// rewrites the tabular `results.csv`/`job_infos.csv` companions (spec
    /// §3, §4.1).
    pub async fn snapshot(&self) -> Result<(), OrchestratorError> {
        self.ensure_run_folder_present().await?;
        let inner = self.inner.lock().await;
        let trials: Vec<Trial> = inner.trials.values().cloned().collect();
        let doc = ExperimentSnapshot::capture(
            &self.run_uuid,
            self.continued_from.as_deref(),
            &inner.parameter_space,
            &trials,
            &self.allocator,
        );
        drop(inner);
        let json = doc
            .to_json()
            .map_err(|e| OrchestratorError::ConfigParse(format!("failed to serialize experiment snapshot: {e}")))?;

        self.write_with_retry(&self.layout.experiment_snapshot(), &json).await?;
        self.write_with_retry(&self.layout.checkpoint(), &json).await?;
        write_results_csv(&self.layout, &trials)?;
        write_job_infos_csv(&self.layout, &trials)?;
        Ok(())
    }

    async fn write_with_retry(&self, path: &std::path::Path, contents: &str) -> Result<(), OrchestratorError> {
        let tmp = path.with_extension("tmp");
        let mut attempt = 0;
        loop {
            let result: std::io::Result<()> = async {
                tokio::fs::write(&tmp, contents).await?;
                tokio::fs::rename(&tmp, path).await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => {
                    return Err(OrchestratorError::DiskFull);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRIES {
                        return Err(OrchestratorError::ResourceUnavailable(err.to_string()));
                    }
                    warn!(attempt, path = %path.display(), error = %err, "retrying write after transient I/O error");
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn ensure_run_folder_present(&self) -> Result<(), OrchestratorError> {
        if !self.layout.exists() {
            return Err(OrchestratorError::RunFolderDeletedMidRun);
        }
        Ok(())
    }
}

/// Rewrites `results.csv`: one row per trial, columns widened to the union
/// of every result name observed so far (spec §3 tabular layout).
fn write_results_csv(layout: &RunLayout, trials: &[Trial]) -> Result<(), OrchestratorError> {
    let mut result_names: BTreeSet<String> = BTreeSet::new();
    for trial in trials {
        result_names.extend(trial.raw_results.keys().cloned());
    }

    let mut writer = csv::Writer::from_path(layout.results_csv())
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    let mut header = vec!["trial_index".to_string(), "status".to_string()];
    header.extend(result_names.iter().cloned());
    writer
        .write_record(&header)
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;

    for trial in trials {
        let mut record = vec![trial.index.to_string(), format!("{:?}", trial.status)];
        for name in &result_names {
            record.push(
                trial
                    .raw_results
                    .get(name)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        writer
            .write_record(&record)
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    Ok(())
}

#[derive(Serialize)]
struct JobInfoRow<'a> {
    trial_index: u64,
    status: String,
    generation_method: String,
    hostname: Option<&'a str>,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    run_time_secs: Option<f64>,
    exit_code: Option<i32>,
    signal: Option<i32>,
}

/// Rewrites `job_infos.csv`: one row per trial regardless of status (spec
/// §3 tabular layout).
fn write_job_infos_csv(layout: &RunLayout, trials: &[Trial]) -> Result<(), OrchestratorError> {
    let mut writer = csv::Writer::from_path(layout.job_infos_csv())
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    for trial in trials {
        writer
            .serialize(JobInfoRow {
                trial_index: trial.index,
                status: format!("{:?}", trial.status),
                generation_method: trial.generation_method.to_string(),
                hostname: trial.hostname.as_deref(),
                start_time: trial.start_time,
                end_time: trial.end_time,
                run_time_secs: trial.run_time_secs(),
                exit_code: trial.exit_code,
                signal: trial.signal,
            })
            .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| OrchestratorError::ResourceUnavailable(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamValue;
    use tempfile::tempdir;

    #[tokio::test]
    async fn attach_and_complete_round_trips() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let store = ExperimentStore::create(layout, "run-1".into(), ParameterSpace::default())
            .await
            .unwrap();

        let index = store.allocator().allocate();
        let mut arm = Arm::new();
        arm.insert("x".to_string(), ParamValue::Number(1.0));
        store.attach_trial(index, arm, GenerationMethod::Sobol).await.unwrap();
        store.mark_running(index, Some("node1".into())).await.unwrap();

        let mut results = BTreeMap::new();
        results.insert("score".to_string(), 0.5);
        store.complete_trial(index, results, Some(0)).await.unwrap();

        let trials = store.trials_snapshot().await;
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].status, TrialStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let store = ExperimentStore::create(layout, "run-1".into(), ParameterSpace::default())
            .await
            .unwrap();
        let index = store.allocator().allocate();
        store.attach_trial(index, Arm::new(), GenerationMethod::Sobol).await.unwrap();
        store.abandon_trial(index).await.unwrap();
        assert!(store.mark_running(index, None).await.is_err());
    }

    #[tokio::test]
    async fn load_from_resumes_trial_indices() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let store = ExperimentStore::create(layout.clone(), "run-1".into(), ParameterSpace::default())
            .await
            .unwrap();
        let index = store.allocator().allocate();
        store.attach_trial(index, Arm::new(), GenerationMethod::Sobol).await.unwrap();
        store.snapshot().await.unwrap();

        let resumed = ExperimentStore::load_from(layout, "run-2".into()).await.unwrap();
        assert_eq!(resumed.allocator().peek(), 1);
        assert_eq!(resumed.trial_count().await, 1);
    }
}
