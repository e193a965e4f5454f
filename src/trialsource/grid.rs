//! Deterministic enumerator over the `gridsearch`-expanded choice space
//! (spec §4.2/§4.3). Used end-to-end by the search-space-exhaustion
//! scenario (spec §8 scenario 5) without needing a real Bayesian backend.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;

use crate::model::{Arm, IndexAllocator, TrialIndex};
use crate::paramspace::{Parameter, ParameterSpace};

use super::{GenerationOutcome, TrialSource};

pub struct GridSource {
    remaining: VecDeque<Arm>,
}

impl GridSource {
    /// `space` must already have had `into_gridsearch` applied (every range
    /// turned into a `Choice`); constraints are applied as a filter over
    /// the cartesian product.
    pub fn new(space: &ParameterSpace) -> Self {
        let mut combos: Vec<Arm> = vec![Arm::new()];
        for p in &space.parameters {
            let extension: Vec<(String, crate::model::ParamValue)> = match p {
                Parameter::Choice { name, values, .. } => {
                    values.iter().map(|v| (name.clone(), v.clone())).collect()
                }
                Parameter::Fixed { name, value } => vec![(name.clone(), value.clone())],
                Parameter::Range { name, lower, .. } => {
                    // Should not occur after gridsearch expansion; fall
                    // back to the lower bound rather than panic.
                    vec![(name.clone(), crate::model::ParamValue::Number(*lower))]
                }
            };
            let mut next = Vec::with_capacity(combos.len() * extension.len());
            for base in &combos {
                for (name, value) in &extension {
                    let mut arm = base.clone();
                    arm.insert(name.clone(), value.clone());
                    next.push(arm);
                }
            }
            combos = next;
        }

        let remaining = combos
            .into_iter()
            .filter(|arm| {
                space
                    .constraints
                    .iter()
                    .all(|c| c.is_satisfied(arm).unwrap_or(false))
            })
            .collect();

        Self { remaining }
    }

    pub fn total_points(&self) -> usize {
        self.remaining.len()
    }
}

#[async_trait]
impl TrialSource for GridSource {
    async fn next(
        &mut self,
        n: usize,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<GenerationOutcome> {
        if self.remaining.is_empty() {
            return Ok(GenerationOutcome::OptimizationComplete);
        }
        let mut out = Vec::new();
        for _ in 0..n {
            let Some(arm) = self.remaining.pop_front() else {
                break;
            };
            out.push((allocator.allocate(), arm));
        }
        Ok(GenerationOutcome::Trials(out))
    }

    async fn observe(
        &mut self,
        _index: TrialIndex,
        _raw_result: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn attach_observation(
        &mut self,
        arm: Arm,
        _raw_result: BTreeMap<String, f64>,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<TrialIndex> {
        self.remaining.retain(|a| a != &arm);
        Ok(allocator.allocate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamValue;

    #[tokio::test]
    async fn exhausts_after_all_points_consumed() {
        let space = ParameterSpace::new(
            vec![Parameter::Choice {
                name: "x".into(),
                ordered: false,
                values: vec![
                    ParamValue::Number(1.0),
                    ParamValue::Number(2.0),
                    ParamValue::Number(3.0),
                ],
            }],
            vec![],
            &[],
        )
        .unwrap();
        let mut source = GridSource::new(&space);
        assert_eq!(source.total_points(), 3);
        let allocator = IndexAllocator::default();
        let mut total = 0;
        loop {
            match source.next(100, &allocator).await.unwrap() {
                GenerationOutcome::Trials(t) if !t.is_empty() => total += t.len(),
                _ => break,
            }
        }
        assert_eq!(total, 3);
        assert!(matches!(
            source.next(1, &allocator).await.unwrap(),
            GenerationOutcome::OptimizationComplete
        ));
    }
}
