//! Shared vocabulary of the optimization run: trials, results, and the
//! objective spec they are scored against. Every other module speaks in
//! terms of these types rather than passing around loose JSON.

use std::collections::BTreeMap;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic trial identity, assigned by the trial source.
pub type TrialIndex = u64;

/// Single source of truth for trial-index allocation, shared between the
/// experiment store and every `TrialSource` implementation so indices stay
/// strictly monotonic and gapless regardless of which generator produced
/// the trial (spec §3, §8).
#[derive(Debug, Default)]
pub struct IndexAllocator {
    next: AtomicU64,
}

impl IndexAllocator {
    pub fn starting_at(next: TrialIndex) -> Self {
        Self {
            next: AtomicU64::new(next),
        }
    }

    pub fn allocate(&self) -> TrialIndex {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> TrialIndex {
        self.next.load(Ordering::SeqCst)
    }
}

/// Names reserved by the run itself; a parameter or result may not use one.
pub const RESERVED_NAMES: &[&str] = &[
    "start_time",
    "end_time",
    "run_time",
    "program_string",
    "exit_code",
    "signal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Direction {
    pub fn is_better(self, candidate: f64, current_best: f64) -> bool {
        match self {
            Direction::Minimize => candidate < current_best,
            Direction::Maximize => candidate > current_best,
        }
    }

    pub fn worst_possible(self) -> f64 {
        match self {
            Direction::Minimize => f64::INFINITY,
            Direction::Maximize => f64::NEG_INFINITY,
        }
    }
}

/// One named, directed objective. `ResultSpec` is an ordered list of these;
/// more than one entry makes the experiment multi-objective (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub name: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultSpec {
    pub entries: Vec<ResultEntry>,
}

impl ResultSpec {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn is_multi_objective(&self) -> bool {
        self.entries.len() > 1
    }
}

/// The tag recorded on a trial identifying which generator produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMethod {
    Sobol,
    Grid,
    Model(String),
    Imported,
}

impl std::fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationMethod::Sobol => write!(f, "Sobol"),
            GenerationMethod::Grid => write!(f, "Grid"),
            GenerationMethod::Model(name) => write!(f, "{name}"),
            GenerationMethod::Imported => write!(f, "Imported"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Staged,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl TrialStatus {
    /// Transitions are append-only and must follow the lifecycle in spec §3.
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, next),
            (Staged, Running)
                | (Staged, Completed)
                | (Staged, Failed)
                | (Staged, Abandoned)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Abandoned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrialStatus::Completed | TrialStatus::Failed | TrialStatus::Abandoned
        )
    }
}

/// A scalar parameter value as carried on a trial's arm. Numbers keep their
/// float representation so choice parameters with numeric-looking string
/// values still sort and compare numerically (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_string(&self) -> String {
        match self {
            ParamValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ParamValue::Text(s) => s.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(s) => s.parse().ok(),
        }
    }
}

pub type Arm = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub index: TrialIndex,
    pub arm: Arm,
    pub status: TrialStatus,
    pub raw_results: BTreeMap<String, f64>,
    pub generation_method: GenerationMethod,
    pub hostname: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl Trial {
    pub fn new(index: TrialIndex, arm: Arm, generation_method: GenerationMethod) -> Self {
        Self {
            index,
            arm,
            status: TrialStatus::Staged,
            raw_results: BTreeMap::new(),
            generation_method,
            hostname: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            signal: None,
        }
    }

    pub fn run_time_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}
