//! Linear constraint parsing (spec §3). The grammar is regular — a run of
//! `term operator` pairs, one comparator, then another run of `term
//! operator` pairs and a final term — so a hand-rolled tokenizer is enough;
//! no parser-combinator dependency earns its keep here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ParamValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Term {
    Number(f64),
    Variable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    raw: String,
    lhs: Vec<(Term, Option<ArithOp>)>,
    comparator: Comparator,
    rhs: Vec<(Term, Option<ArithOp>)>,
}

impl Constraint {
    /// Parses `expr (<=|>=) expr` where `expr` is `term (op term)*`.
    /// Rejected constraints (anything not matching
    /// `(term operator)* term comparator (term operator)* term`) return a
    /// descriptive error; the caller treats that as fatal (spec §3).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (cmp, cmp_idx) = find_comparator(raw)?;
        let (lhs_str, rhs_str) = (&raw[..cmp_idx], &raw[cmp_idx + 2..]);
        let lhs = parse_expr(lhs_str)?;
        let rhs = parse_expr(rhs_str)?;
        if lhs.is_empty() || rhs.is_empty() {
            return Err(format!("constraint '{raw}' is missing an operand"));
        }
        Ok(Self {
            raw: raw.to_string(),
            lhs,
            comparator: cmp,
            rhs,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Confirms every variable referenced actually exists in the parameter
    /// space (spec §4.2: "Constraints are validated against the parameter
    /// names before experiment creation").
    pub fn validate_against(&self, names: &[&str]) -> Result<(), String> {
        for (term, _) in self.lhs.iter().chain(self.rhs.iter()) {
            if let Term::Variable(v) = term {
                if !names.contains(&v.as_str()) {
                    return Err(format!(
                        "constraint '{}' references unknown parameter '{v}'",
                        self.raw
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evaluates the constraint against a concrete arm. Returns `true` when
    /// satisfied.
    pub fn is_satisfied(&self, arm: &BTreeMap<String, ParamValue>) -> Result<bool, String> {
        let lhs = eval_expr(&self.lhs, arm)?;
        let rhs = eval_expr(&self.rhs, arm)?;
        Ok(match self.comparator {
            Comparator::Le => lhs <= rhs,
            Comparator::Ge => lhs >= rhs,
        })
    }
}

fn find_comparator(raw: &str) -> Result<(Comparator, usize), String> {
    if let Some(idx) = raw.find("<=") {
        return Ok((Comparator::Le, idx));
    }
    if let Some(idx) = raw.find(">=") {
        return Ok((Comparator::Ge, idx));
    }
    Err(format!(
        "constraint '{raw}' must contain exactly one of '<=' or '>='"
    ))
}

fn parse_expr(expr: &str) -> Result<Vec<(Term, Option<ArithOp>)>, String> {
    let mut tokens = Vec::new();
    let mut chars = expr.trim().chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<(Term, Option<ArithOp>)>| -> Result<(), String> {
        let trimmed = current.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let term = if let Ok(n) = trimmed.parse::<f64>() {
            Term::Number(n)
        } else {
            Term::Variable(trimmed.to_string())
        };
        tokens.push((term, None));
        current.clear();
        Ok(())
    };

    while let Some(&c) = chars.peek() {
        match c {
            '+' | '-' | '*' | '/' => {
                flush(&mut current, &mut tokens)?;
                let op = match c {
                    '+' => ArithOp::Add,
                    '-' => ArithOp::Sub,
                    '*' => ArithOp::Mul,
                    _ => ArithOp::Div,
                };
                if let Some(last) = tokens.last_mut() {
                    last.1 = Some(op);
                } else {
                    return Err(format!("constraint expression '{expr}' starts with an operator"));
                }
                chars.next();
            }
            _ => {
                current.push(c);
                chars.next();
            }
        }
    }
    flush(&mut current, &mut tokens)?;

    if tokens.is_empty() {
        return Err(format!("constraint expression '{expr}' has no terms"));
    }
    Ok(tokens)
}

fn eval_expr(
    tokens: &[(Term, Option<ArithOp>)],
    arm: &BTreeMap<String, ParamValue>,
) -> Result<f64, String> {
    let mut result = eval_term(&tokens[0].0, arm)?;
    let mut pending_op = tokens[0].1;
    for (term, next_op) in &tokens[1..] {
        let value = eval_term(term, arm)?;
        result = match pending_op {
            Some(ArithOp::Add) => result + value,
            Some(ArithOp::Sub) => result - value,
            Some(ArithOp::Mul) => result * value,
            Some(ArithOp::Div) => result / value,
            None => value,
        };
        pending_op = *next_op;
    }
    Ok(result)
}

fn eval_term(term: &Term, arm: &BTreeMap<String, ParamValue>) -> Result<f64, String> {
    match term {
        Term::Number(n) => Ok(*n),
        Term::Variable(name) => arm
            .get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| format!("no numeric value for '{name}' in arm")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_constraint() {
        let c = Constraint::parse("x + y <= 10").unwrap();
        c.validate_against(&["x", "y"]).unwrap();
        let mut arm = BTreeMap::new();
        arm.insert("x".to_string(), ParamValue::Number(3.0));
        arm.insert("y".to_string(), ParamValue::Number(4.0));
        assert!(c.is_satisfied(&arm).unwrap());
    }

    #[test]
    fn rejects_constraint_without_comparator() {
        assert!(Constraint::parse("x + y").is_err());
    }

    #[test]
    fn rejects_missing_operand() {
        assert!(Constraint::parse("x <= ").is_err());
    }

    #[test]
    fn rejects_unknown_variable() {
        let c = Constraint::parse("x <= 10").unwrap();
        assert!(c.validate_against(&["y"]).is_err());
    }
}
