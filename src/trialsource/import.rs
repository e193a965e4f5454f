//! Cross-run import (spec §4.3, steps 1-5): used when the user continues a
//! prior run. Walks the parent snapshot's completed trials, dedupes by a
//! canonical hash of `(params, result)`, and feeds survivors into the new
//! run's `TrialSource` via `attach_observation` without consuming the
//! generator's own quota.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::model::{Arm, GenerationMethod, IndexAllocator, ParamValue, Trial, TrialIndex, TrialStatus};

use super::TrialSource;

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportCounters {
    pub restored: usize,
    pub double_hash_skipped: usize,
    pub missing_result_skipped: usize,
}

/// Deterministic fingerprint of a completed trial's `(params, result)` pair,
/// independent of map iteration order (both `Arm` and the result map are
/// `BTreeMap`s already, so iteration order is stable).
fn canonical_hash(arm: &Arm, results: &BTreeMap<String, f64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (k, v) in arm {
        k.hash(&mut hasher);
        v.as_string().hash(&mut hasher);
    }
    for (k, v) in results {
        k.hash(&mut hasher);
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Flips every numeric arm value between its integer and float textual
/// forms; used to retry an `attach_observation` call that failed because
/// the underlying generator expected the other type (spec §4.3 step 5).
fn coerce_types(arm: &Arm) -> Arm {
    arm.iter()
        .map(|(k, v)| {
            let coerced = match v {
                // The generator rejected this as the wrong numeric type
                // (int expected, float given, or vice versa); rounding is
                // the only coercion meaningful once both are `f64` here.
                ParamValue::Number(n) => ParamValue::Number(n.round()),
                ParamValue::Text(s) => s
                    .parse::<f64>()
                    .map(ParamValue::Number)
                    .unwrap_or_else(|_| ParamValue::Text(s.clone())),
            };
            (k.clone(), coerced)
        })
        .collect()
}

fn looks_like_type_mismatch(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("type") && (msg.contains("mismatch") || msg.contains("expected"))
}

pub async fn import_from_parent(
    parent_trials: &[Trial],
    source: &mut dyn TrialSource,
    allocator: &IndexAllocator,
) -> anyhow::Result<(ImportCounters, Vec<TrialIndex>)> {
    let mut counters = ImportCounters::default();
    let mut seen_hashes: HashSet<u64> = HashSet::new();
    let mut restored_indices = Vec::new();

    for trial in parent_trials {
        if trial.status != TrialStatus::Completed {
            continue;
        }

        // "result" columns must be finite numbers to count as restorable.
        if trial.raw_results.is_empty()
            || trial.raw_results.values().any(|v| !v.is_finite())
        {
            counters.missing_result_skipped += 1;
            continue;
        }

        let hash = canonical_hash(&trial.arm, &trial.raw_results);
        if !seen_hashes.insert(hash) {
            counters.double_hash_skipped += 1;
            continue;
        }

        let attempt = source
            .attach_observation(trial.arm.clone(), trial.raw_results.clone(), allocator)
            .await;

        let index = match attempt {
            Ok(index) => index,
            Err(err) if looks_like_type_mismatch(&err) => {
                let coerced = coerce_types(&trial.arm);
                source
                    .attach_observation(coerced, trial.raw_results.clone(), allocator)
                    .await?
            }
            Err(err) => return Err(err),
        };

        restored_indices.push(index);
        counters.restored += 1;
    }

    Ok((counters, restored_indices))
}

/// Reconstructs a `Trial` as it is recorded for the new run once imported,
/// tagged with the `Imported` generation method (spec §3 identity fields).
pub fn as_imported_trial(index: TrialIndex, source: &Trial) -> Trial {
    let mut trial = Trial::new(index, source.arm.clone(), GenerationMethod::Imported);
    trial.raw_results = source.raw_results.clone();
    trial.status = TrialStatus::Completed;
    trial.start_time = source.start_time;
    trial.end_time = source.end_time;
    trial.exit_code = source.exit_code;
    trial.hostname = source.hostname.clone();
    trial
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trialsource::grid::GridSource;
    use crate::paramspace::{Parameter, ParameterSpace};

    fn make_trial(index: TrialIndex, x: f64, result: f64) -> Trial {
        let mut arm = Arm::new();
        arm.insert("x".into(), ParamValue::Number(x));
        let mut t = Trial::new(index, arm, GenerationMethod::Sobol);
        t.status = TrialStatus::Completed;
        t.raw_results.insert("score".into(), result);
        t
    }

    #[tokio::test]
    async fn dedups_identical_trials() {
        let space = ParameterSpace::new(
            vec![Parameter::Choice {
                name: "x".into(),
                ordered: false,
                values: vec![ParamValue::Number(1.0), ParamValue::Number(2.0)],
            }],
            vec![],
            &[],
        )
        .unwrap();
        let mut source = GridSource::new(&space);
        let allocator = IndexAllocator::default();

        let trials = vec![make_trial(0, 1.0, 0.5), make_trial(1, 1.0, 0.5)];
        let (counters, restored) = import_from_parent(&trials, &mut source, &allocator)
            .await
            .unwrap();
        assert_eq!(counters.restored, 1);
        assert_eq!(counters.double_hash_skipped, 1);
        assert_eq!(restored.len(), 1);
    }

    #[tokio::test]
    async fn skips_non_finite_results() {
        let space = ParameterSpace::new(
            vec![Parameter::Choice {
                name: "x".into(),
                ordered: false,
                values: vec![ParamValue::Number(1.0)],
            }],
            vec![],
            &[],
        )
        .unwrap();
        let mut source = GridSource::new(&space);
        let allocator = IndexAllocator::default();
        let trials = vec![make_trial(0, 1.0, f64::NAN)];
        let (counters, restored) = import_from_parent(&trials, &mut source, &allocator)
            .await
            .unwrap();
        assert_eq!(counters.missing_result_skipped, 1);
        assert!(restored.is_empty());
    }
}
