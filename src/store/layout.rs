//! Run-folder layout (spec §3): every path the rest of the crate touches
//! is named here once, so no other module hardcodes a filename.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_files_dir(&self) -> PathBuf {
        self.root.join("state_files")
    }

    pub fn experiment_snapshot(&self) -> PathBuf {
        self.state_files_dir().join("ax_client.experiment.json")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.state_files_dir().join("checkpoint.json")
    }

    pub fn results_csv(&self) -> PathBuf {
        self.root.join("results.csv")
    }

    pub fn job_infos_csv(&self) -> PathBuf {
        self.root.join("job_infos.csv")
    }

    pub fn result_names_file(&self) -> PathBuf {
        self.root.join("result_names.txt")
    }

    pub fn result_min_max_file(&self) -> PathBuf {
        self.root.join("result_min_max.txt")
    }

    pub fn worker_usage_csv(&self) -> PathBuf {
        self.root.join("worker_usage.csv")
    }

    pub fn failed_logs_dir(&self) -> PathBuf {
        self.root.join("failed_logs")
    }

    pub fn failed_headers_csv(&self) -> PathBuf {
        self.failed_logs_dir().join("headers.csv")
    }

    pub fn failed_parameters_csv(&self) -> PathBuf {
        self.failed_logs_dir().join("parameters.csv")
    }

    pub fn single_runs_dir(&self) -> PathBuf {
        self.root.join("single_runs")
    }

    pub fn single_run_dir(&self, job_id: &str) -> PathBuf {
        self.single_runs_dir().join(job_id)
    }

    pub fn defective_nodes(&self) -> PathBuf {
        self.root.join("defective_nodes")
    }

    pub fn global_vars(&self) -> PathBuf {
        self.root.join("global_vars.json")
    }

    pub fn env_snapshot(&self) -> PathBuf {
        self.root.join("environment")
    }

    pub fn run_uuid_file(&self) -> PathBuf {
        self.root.join("run_uuid")
    }

    pub fn uuid_of_continued_run_file(&self) -> PathBuf {
        self.root.join("uuid_of_continued_run")
    }

    pub fn counter_file(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.count"))
    }

    pub fn orchestrator_errors_log(&self) -> PathBuf {
        self.root.join("orchestrator_errors.log")
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Picks the next unused `<run_dir>/<experiment_name>/<N>/` folder,
    /// matching the original source's `RUN_FOLDER_NUMBER` scan (spec §3).
    pub fn next_available(run_dir: &Path, experiment_name: &str) -> Self {
        let base = run_dir.join(experiment_name);
        let mut n = 0u64;
        if let Ok(entries) = std::fs::read_dir(&base) {
            let max_existing = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter_map(|name| name.parse::<u64>().ok())
                .max();
            if let Some(max) = max_existing {
                n = max + 1;
            }
        }
        loop {
            let candidate = base.join(n.to_string());
            if !candidate.exists() {
                return Self::new(candidate);
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_root() {
        let layout = RunLayout::new("/tmp/run_1");
        assert_eq!(layout.single_run_dir("job7"), PathBuf::from("/tmp/run_1/single_runs/job7"));
        assert_eq!(layout.experiment_snapshot(), PathBuf::from("/tmp/run_1/state_files/ax_client.experiment.json"));
    }
}
