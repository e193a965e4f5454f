//! The experiment snapshot document (spec §4.1): a full-rewrite JSON
//! capture of every trial plus the parameter space, written to both
//! `state_files/ax_client.experiment.json` and the redundant
//! `checkpoint.json` so a crash between the two writes still leaves one
//! readable copy.

use serde::{Deserialize, Serialize};

use crate::model::{IndexAllocator, Trial};
use crate::paramspace::ParameterSpace;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub run_uuid: String,
    pub continued_from: Option<String>,
    pub parameter_space: ParameterSpace,
    pub trials: Vec<Trial>,
    pub next_trial_index: u64,
}

impl ExperimentSnapshot {
    pub fn capture(
        run_uuid: &str,
        continued_from: Option<&str>,
        parameter_space: &ParameterSpace,
        trials: &[Trial],
        allocator: &IndexAllocator,
    ) -> Self {
        Self {
            run_uuid: run_uuid.to_string(),
            continued_from: continued_from.map(str::to_string),
            parameter_space: parameter_space.clone(),
            trials: trials.to_vec(),
            next_trial_index: allocator.peek(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(contents: &str) -> serde_json::Result<Self> {
        serde_json::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GenerationMethod;

    #[test]
    fn round_trips_through_json() {
        let space = ParameterSpace::default();
        let allocator = IndexAllocator::starting_at(0);
        let trial = Trial::new(allocator.allocate(), Default::default(), GenerationMethod::Sobol);
        let snapshot = ExperimentSnapshot::capture("run-1", None, &space, &[trial], &allocator);
        let json = snapshot.to_json().unwrap();
        let restored = ExperimentSnapshot::from_json(&json).unwrap();
        assert_eq!(restored.run_uuid, "run-1");
        assert_eq!(restored.trials.len(), 1);
        assert_eq!(restored.next_trial_index, 1);
    }
}
