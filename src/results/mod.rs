//! Result Parser (spec §4.7): extracts one or more named numeric results
//! from job stdout. A streaming line scanner is all the contract needs —
//! no process-level IPC, per spec §9's design note on subprocess output
//! scraping.

pub mod occ;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Direction;

/// `V` from spec §4.7: the sentinel magnitude returned when a declared
/// result name is never found in stdout. Cross-checked against the
/// original source's `VAL_IF_NOTHING_FOUND` constant.
pub const ERROR_SENTINEL_MAGNITUDE: f64 = 99999999999999999999999999999999999999999999999999999999999.0;

fn result_pattern(name: &str) -> Regex {
    Regex::new(&format!(r"(?m)\s*{}\d*:\s*(-?\d+(?:\.\d+)?)", regex::escape(name)))
        .expect("constructed result regex is always valid")
}

static HISTORICAL_RESULT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)\s*RESULT\d*:\s*(-?\d+(?:\.\d+)?)").expect("valid regex"));

static OO_INFO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*OO-Info:\s*([A-Za-z0-9_]+):\s*(.*)$").expect("valid regex"));

#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    /// `None` for a declared result name never found in stdout.
    pub results: BTreeMap<String, Option<f64>>,
    pub oo_info: BTreeMap<String, String>,
}

/// Scans `stdout` line by line for each declared result name's first
/// match, plus any `OO-Info: KEY: VALUE` side-channel lines (spec §4.7).
/// Single-result experiments additionally accept the historical
/// `RESULT: <n>` spelling.
pub fn parse_output(stdout: &str, result_names: &[String]) -> ParsedOutput {
    let mut results = BTreeMap::new();

    for name in result_names {
        let pattern = result_pattern(name);
        let found = pattern.captures(stdout).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse::<f64>().ok());
        results.insert(name.clone(), found);
    }

    if result_names.len() == 1 {
        let name = &result_names[0];
        if results.get(name).copied().flatten().is_none() {
            if let Some(value) = HISTORICAL_RESULT_RE
                .captures(stdout)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
            {
                results.insert(name.clone(), Some(value));
            }
        }
    }

    let mut oo_info = BTreeMap::new();
    for line in stdout.lines() {
        if let Some(caps) = OO_INFO_RE.captures(line) {
            oo_info.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }

    ParsedOutput { results, oo_info }
}

/// Fills in the error sentinel (signed to match each result's objective
/// direction) for any result name that was never found, turning a
/// `ParsedOutput` into the raw numeric map the dispatcher stores.
pub fn resolve_with_sentinel(
    parsed: &ParsedOutput,
    directions: &BTreeMap<String, Direction>,
) -> BTreeMap<String, f64> {
    parsed
        .results
        .iter()
        .map(|(name, value)| {
            let resolved = value.unwrap_or_else(|| {
                let sign = match directions.get(name) {
                    Some(Direction::Maximize) => -1.0,
                    _ => 1.0,
                };
                sign * ERROR_SENTINEL_MAGNITUDE
            });
            (name.clone(), resolved)
        })
        .collect()
}

pub fn all_results_found(parsed: &ParsedOutput) -> bool {
    parsed.results.values().all(|v| v.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_named_result() {
        let parsed = parse_output("warming up\nRESULT1: 3.5\ndone", &["RESULT".to_string()]);
        assert_eq!(parsed.results.get("RESULT").copied().flatten(), Some(3.5));
    }

    #[test]
    fn accepts_historical_result_form_for_single_objective() {
        let parsed = parse_output("RESULT: 42", &["score".to_string()]);
        assert_eq!(parsed.results.get("score").copied().flatten(), Some(42.0));
    }

    #[test]
    fn missing_result_is_none() {
        let parsed = parse_output("nothing here", &["score".to_string()]);
        assert_eq!(parsed.results.get("score").copied().flatten(), None);
        assert!(!all_results_found(&parsed));
    }

    #[test]
    fn captures_oo_info_lines() {
        let parsed = parse_output("OO-Info: worker_id: 7\nRESULT: 1", &["RESULT".to_string()]);
        assert_eq!(parsed.oo_info.get("worker_id").map(String::as_str), Some("7"));
    }

    #[test]
    fn sentinel_sign_matches_direction() {
        let mut parsed = ParsedOutput::default();
        parsed.results.insert("score".to_string(), None);
        let mut dirs = BTreeMap::new();
        dirs.insert("score".to_string(), Direction::Maximize);
        let resolved = resolve_with_sentinel(&parsed, &dirs);
        assert_eq!(resolved["score"], -ERROR_SENTINEL_MAGNITUDE);
    }
}
