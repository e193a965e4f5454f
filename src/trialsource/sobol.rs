//! Quasi-random warm-up step (spec §4.3 generation strategy, step 1):
//! samples `capacity = max(num_parallel_jobs, random_steps)` points from a
//! seeded generator before the (out-of-scope) Bayesian step takes over.

use std::collections::BTreeMap;
use std::collections::HashSet;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{Arm, IndexAllocator, ParamValue, TrialIndex};
use crate::paramspace::{Parameter, ParameterKind, ParameterSpace};

use super::{GenerationOutcome, TrialSource};

pub struct SobolSource {
    space: ParameterSpace,
    capacity: usize,
    produced: usize,
    rng: StdRng,
    should_deduplicate: bool,
    seen: HashSet<Vec<String>>,
    /// Consecutive attempts that produced only already-seen points; used to
    /// decide the generator is exhausted rather than loop forever.
    stall_budget: usize,
}

impl SobolSource {
    pub fn new(space: ParameterSpace, capacity: usize, seed: u64, should_deduplicate: bool) -> Self {
        Self {
            space,
            capacity,
            produced: 0,
            rng: StdRng::seed_from_u64(seed),
            should_deduplicate,
            seen: HashSet::new(),
            stall_budget: 50,
        }
    }

    fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.produced)
    }

    fn sample_one(&mut self) -> Arm {
        let mut arm: Arm = Arm::new();
        for p in &self.space.parameters {
            let value = match p {
                Parameter::Range {
                    name: _,
                    kind,
                    lower,
                    upper,
                    ..
                } => {
                    let mut v = self.rng.gen_range(*lower..=*upper);
                    if matches!(kind, ParameterKind::Integer) {
                        v = v.round();
                    }
                    ParamValue::Number(v)
                }
                Parameter::Choice { values, .. } => {
                    let idx = self.rng.gen_range(0..values.len());
                    values[idx].clone()
                }
                Parameter::Fixed { value, .. } => value.clone(),
            };
            arm.insert(p.name().to_string(), value);
        }
        arm
    }

    fn fingerprint(arm: &Arm) -> Vec<String> {
        arm.iter().map(|(k, v)| format!("{k}={}", v.as_string())).collect()
    }

    /// Mirrors `GridSource::new`'s constraint filter (spec §8's constraint
    /// soundness law applies to every generator, not just the grid one).
    fn satisfies_constraints(&self, arm: &Arm) -> bool {
        self.space
            .constraints
            .iter()
            .all(|c| c.is_satisfied(arm).unwrap_or(false))
    }
}

#[async_trait]
impl TrialSource for SobolSource {
    async fn next(
        &mut self,
        n: usize,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<GenerationOutcome> {
        let want = n.min(self.remaining_capacity());
        if want == 0 {
            return Ok(GenerationOutcome::OptimizationComplete);
        }

        let mut out = Vec::with_capacity(want);
        let mut stalls = 0usize;
        while out.len() < want {
            let arm = self.sample_one();
            if !self.satisfies_constraints(&arm) {
                stalls += 1;
                if stalls >= self.stall_budget {
                    break;
                }
                continue;
            }
            if self.should_deduplicate {
                let fp = Self::fingerprint(&arm);
                if self.seen.contains(&fp) {
                    stalls += 1;
                    if stalls >= self.stall_budget {
                        break;
                    }
                    continue;
                }
                self.seen.insert(fp);
            }
            stalls = 0;
            let index = allocator.allocate();
            self.produced += 1;
            out.push((index, arm));
        }

        if out.is_empty() {
            return Ok(GenerationOutcome::OptimizationComplete);
        }
        Ok(GenerationOutcome::Trials(out))
    }

    async fn observe(
        &mut self,
        _index: TrialIndex,
        _raw_result: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()> {
        // The random step does not adapt to observations.
        Ok(())
    }

    async fn attach_observation(
        &mut self,
        arm: Arm,
        _raw_result: BTreeMap<String, f64>,
        allocator: &IndexAllocator,
    ) -> anyhow::Result<TrialIndex> {
        if self.should_deduplicate {
            self.seen.insert(Self::fingerprint(&arm));
        }
        // Counts against the random step's quota: a continuation that
        // already fulfilled it skips the random step entirely (spec §4.3).
        self.produced += 1;
        Ok(allocator.allocate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramspace::Parameter;

    fn space() -> ParameterSpace {
        ParameterSpace::new(
            vec![Parameter::Range {
                name: "x".into(),
                kind: ParameterKind::Real,
                lower: 0.0,
                upper: 10.0,
                log_scale: false,
            }],
            vec![],
            &[],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn respects_capacity() {
        let mut source = SobolSource::new(space(), 3, 42, false);
        let allocator = IndexAllocator::default();
        let mut total = 0;
        loop {
            match source.next(2, &allocator).await.unwrap() {
                GenerationOutcome::Trials(t) => total += t.len(),
                GenerationOutcome::OptimizationComplete => break,
            }
        }
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn respects_declared_constraints() {
        use crate::paramspace::Constraint;

        let mut space = space();
        space.constraints = vec![Constraint::parse("x <= 3").unwrap()];
        let mut source = SobolSource::new(space, 5, 7, false);
        let allocator = IndexAllocator::default();
        let mut total = 0;
        loop {
            match source.next(5, &allocator).await.unwrap() {
                GenerationOutcome::Trials(trials) => {
                    for (_, arm) in &trials {
                        let x = arm.get("x").unwrap().as_f64().unwrap();
                        assert!(x <= 3.0);
                    }
                    total += trials.len();
                }
                GenerationOutcome::OptimizationComplete => break,
            }
        }
        assert!(total > 0);
    }

    #[tokio::test]
    async fn indices_are_monotonic() {
        let mut source = SobolSource::new(space(), 5, 1, false);
        let allocator = IndexAllocator::default();
        let mut last = None;
        while let GenerationOutcome::Trials(trials) = source.next(5, &allocator).await.unwrap() {
            for (idx, _) in trials {
                if let Some(prev) = last {
                    assert!(idx > prev);
                }
                last = Some(idx);
            }
        }
    }
}
