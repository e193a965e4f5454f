//! Parameter space: typed parameter definitions, bounds, constraints,
//! validation, and grid expansion (spec §4.2).

pub mod constraint;
pub mod grammar;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use constraint::Constraint;
pub use grammar::parse_cli_parameters;

use crate::model::{ParamValue, RESERVED_NAMES};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    Integer,
    Real,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    Range {
        name: String,
        kind: ParameterKind,
        lower: f64,
        upper: f64,
        log_scale: bool,
    },
    Choice {
        name: String,
        ordered: bool,
        values: Vec<ParamValue>,
    },
    Fixed {
        name: String,
        value: ParamValue,
    },
}

impl Parameter {
    pub fn name(&self) -> &str {
        match self {
            Parameter::Range { name, .. } => name,
            Parameter::Choice { name, .. } => name,
            Parameter::Fixed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub parameters: Vec<Parameter>,
    pub constraints: Vec<Constraint>,
}

impl ParameterSpace {
    pub fn new(
        parameters: Vec<Parameter>,
        constraints: Vec<Constraint>,
        result_names: &[String],
    ) -> Result<Self, String> {
        let space = Self {
            parameters,
            constraints,
        };
        space.validate(result_names)?;
        Ok(space)
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name()).collect()
    }

    /// Validates names, reserved words, and range bounds, then the
    /// constraint grammar against the resulting name set (spec §4.2). A
    /// parameter may not share a name with any configured result column
    /// (spec §3) — checked against `result_names`.
    pub fn validate(&self, result_names: &[String]) -> Result<(), String> {
        let mut seen = BTreeMap::new();
        for p in &self.parameters {
            let name = p.name();
            if !NAME_RE.is_match(name) {
                return Err(format!(
                    "parameter name '{name}' must match [A-Za-z0-9_]+"
                ));
            }
            if RESERVED_NAMES.contains(&name) {
                return Err(format!("parameter name '{name}' is reserved"));
            }
            if result_names.iter().any(|r| r == name) {
                return Err(format!(
                    "parameter name '{name}' collides with a configured result name"
                ));
            }
            if seen.insert(name.to_string(), ()).is_some() {
                return Err(format!("duplicate parameter name '{name}'"));
            }
            if let Parameter::Range { lower, upper, .. } = p {
                if lower > upper {
                    return Err(format!(
                        "parameter '{name}' has lower bound {lower} greater than upper bound {upper}"
                    ));
                }
            }
        }

        let names: Vec<&str> = self.names();
        for c in &self.constraints {
            c.validate_against(&names)?;
        }
        Ok(())
    }

    /// Expands every range into an ordered choice of `max_eval` linearly
    /// spaced points (inclusive endpoints, floored to integers for integer
    /// ranges), deduplicated and sorted — the `gridsearch` mode of §4.2.
    pub fn into_gridsearch(self, max_eval: usize) -> Self {
        let max_eval = max_eval.max(1);
        let parameters = self
            .parameters
            .into_iter()
            .map(|p| match p {
                Parameter::Range {
                    name,
                    kind,
                    lower,
                    upper,
                    ..
                } => {
                    let mut points: Vec<f64> = if max_eval == 1 {
                        vec![lower]
                    } else {
                        (0..max_eval)
                            .map(|i| lower + (upper - lower) * (i as f64) / ((max_eval - 1) as f64))
                            .collect()
                    };
                    if matches!(kind, ParameterKind::Integer) {
                        for v in points.iter_mut() {
                            *v = v.round();
                        }
                    }
                    points.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    points.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
                    Parameter::Choice {
                        name,
                        ordered: true,
                        values: points.into_iter().map(ParamValue::Number).collect(),
                    }
                }
                other => other,
            })
            .collect();
        Self {
            parameters,
            constraints: self.constraints,
        }
    }

    /// Widens range bounds to cover previously observed values on
    /// continuation; bounds are never narrowed silently (spec §4.2). Returns
    /// the names of any parameters whose bounds would have narrowed, so the
    /// caller can surface a warning.
    pub fn widen_to_observed(&mut self, observed: &BTreeMap<String, (f64, f64)>) {
        for p in self.parameters.iter_mut() {
            if let Parameter::Range { name, lower, upper, .. } = p {
                let Some((obs_min, obs_max)) = observed.get(name) else {
                    continue;
                };
                if obs_min < lower {
                    *lower = *obs_min;
                }
                if obs_max > upper {
                    *upper = *obs_max;
                }
            }
        }
    }

    /// Compares this (freshly declared) space against the parent run's
    /// declared bounds and reports any range whose declared bounds are
    /// strictly narrower than before. Narrowing on continuation is allowed
    /// but must be surfaced, never applied silently (spec §4.2).
    pub fn narrowed_from(&self, previous: &ParameterSpace) -> Vec<String> {
        let mut narrowed = Vec::new();
        for p in &self.parameters {
            if let Parameter::Range { name, lower, upper, .. } = p {
                let prev = previous.parameters.iter().find(|q| q.name() == name);
                if let Some(Parameter::Range {
                    lower: prev_lower,
                    upper: prev_upper,
                    ..
                }) = prev
                {
                    if lower > prev_lower || upper < prev_upper {
                        narrowed.push(name.clone());
                    }
                }
            }
        }
        narrowed
    }
}

/// Normalizes equal-bounds ranges per spec §3: equal bounds with a nonzero
/// value are auto-mirrored (`lower := -upper`); equal-zero bounds are a
/// fatal configuration error.
pub fn normalize_range(
    name: &str,
    kind: ParameterKind,
    mut lower: f64,
    mut upper: f64,
) -> Result<Parameter, String> {
    if matches!(kind, ParameterKind::Integer) {
        lower = lower.floor();
        upper = upper.ceil();
    }
    if (lower - upper).abs() < f64::EPSILON {
        if upper == 0.0 {
            return Err(format!(
                "parameter '{name}' has equal bounds of zero, which is not a valid range"
            ));
        }
        lower = -upper;
    }
    Ok(Parameter::Range {
        name: name.to_string(),
        kind,
        lower,
        upper,
        log_scale: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_name() {
        let params = vec![Parameter::Fixed {
            name: "exit_code".into(),
            value: ParamValue::Number(1.0),
        }];
        assert!(ParameterSpace::new(params, vec![], &[]).is_err());
    }

    #[test]
    fn rejects_bad_name_chars() {
        let params = vec![Parameter::Fixed {
            name: "bad-name".into(),
            value: ParamValue::Number(1.0),
        }];
        assert!(ParameterSpace::new(params, vec![], &[]).is_err());
    }

    #[test]
    fn rejects_parameter_colliding_with_result_name() {
        let params = vec![Parameter::Fixed {
            name: "score".into(),
            value: ParamValue::Number(1.0),
        }];
        assert!(ParameterSpace::new(params, vec![], &["score".to_string()]).is_err());
    }

    #[test]
    fn equal_nonzero_bounds_mirror() {
        let p = normalize_range("x", ParameterKind::Real, 5.0, 5.0).unwrap();
        match p {
            Parameter::Range { lower, upper, .. } => {
                assert_eq!(lower, -5.0);
                assert_eq!(upper, 5.0);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn equal_zero_bounds_is_fatal() {
        assert!(normalize_range("x", ParameterKind::Real, 0.0, 0.0).is_err());
    }

    #[test]
    fn gridsearch_expands_and_dedups() {
        let params = vec![Parameter::Range {
            name: "x".into(),
            kind: ParameterKind::Integer,
            lower: 0.0,
            upper: 2.0,
            log_scale: false,
        }];
        let space = ParameterSpace::new(params, vec![], &[])
            .unwrap()
            .into_gridsearch(10);
        match &space.parameters[0] {
            Parameter::Choice { values, .. } => {
                assert_eq!(values.len(), 3); // 0,1,2 after integer rounding+dedup
            }
            _ => panic!("expected choice"),
        }
    }
}
