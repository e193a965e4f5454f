//! Parses the repeated `--parameter NAME TYPE ...` CLI grammar (spec §6)
//! into typed `Parameter` values. Clap's `ArgAction::Append` flattens every
//! `--parameter` occurrence into one token stream, so this is a small
//! hand-rolled scanner rather than a derive — the grammar is regular, not
//! recursive, same reasoning as `constraint::parse`.

use crate::model::ParamValue;

use super::{normalize_range, Parameter, ParameterKind};

pub fn parse_cli_parameters(tokens: &[String]) -> Result<Vec<Parameter>, String> {
    let mut parameters = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let name = tokens[i].clone();
        i += 1;
        let kind_token = tokens
            .get(i)
            .ok_or_else(|| format!("parameter '{name}' is missing its type"))?
            .to_lowercase();
        i += 1;

        let parameter = match kind_token.as_str() {
            "range" => {
                let lower: f64 = tokens
                    .get(i)
                    .ok_or_else(|| format!("parameter '{name}' range is missing its lower bound"))?
                    .parse()
                    .map_err(|_| format!("parameter '{name}' has a non-numeric lower bound"))?;
                i += 1;
                let upper: f64 = tokens
                    .get(i)
                    .ok_or_else(|| format!("parameter '{name}' range is missing its upper bound"))?
                    .parse()
                    .map_err(|_| format!("parameter '{name}' has a non-numeric upper bound"))?;
                i += 1;

                let mut kind = ParameterKind::Real;
                if let Some(tok) = tokens.get(i) {
                    match tok.to_lowercase().as_str() {
                        "int" => {
                            kind = ParameterKind::Integer;
                            i += 1;
                        }
                        "float" => {
                            kind = ParameterKind::Real;
                            i += 1;
                        }
                        _ => {}
                    }
                }

                let mut log_scale = false;
                if let Some(tok) = tokens.get(i) {
                    if let Some(value) = tok.strip_prefix("log:") {
                        log_scale = value.eq_ignore_ascii_case("true");
                        i += 1;
                    }
                }

                let mut range = normalize_range(&name, kind, lower, upper)?;
                if let Parameter::Range { log_scale: ls, .. } = &mut range {
                    *ls = log_scale;
                }
                range
            }
            "fixed" => {
                let raw = tokens
                    .get(i)
                    .ok_or_else(|| format!("parameter '{name}' fixed is missing its value"))?;
                i += 1;
                Parameter::Fixed {
                    name: name.clone(),
                    value: parse_scalar(raw),
                }
            }
            "choice" => {
                let raw = tokens
                    .get(i)
                    .ok_or_else(|| format!("parameter '{name}' choice is missing its values"))?;
                i += 1;
                let values = raw.split(',').map(parse_scalar).collect();
                Parameter::Choice {
                    name: name.clone(),
                    ordered: false,
                    values,
                }
            }
            other => return Err(format!("parameter '{name}' has unknown type '{other}'")),
        };

        parameters.push(parameter);
    }

    Ok(parameters)
}

fn parse_scalar(raw: &str) -> ParamValue {
    match raw.parse::<f64>() {
        Ok(n) => ParamValue::Number(n),
        Err(_) => ParamValue::Text(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_range_with_kind_and_log() {
        let params = parse_cli_parameters(&tokens("x range 0 10 int log:true")).unwrap();
        match &params[0] {
            Parameter::Range { kind, lower, upper, log_scale, .. } => {
                assert_eq!(*kind, ParameterKind::Integer);
                assert_eq!(*lower, 0.0);
                assert_eq!(*upper, 10.0);
                assert!(*log_scale);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn parses_fixed_and_choice() {
        let params = parse_cli_parameters(&tokens("a fixed 7 b choice 1,2,3")).unwrap();
        assert!(matches!(&params[0], Parameter::Fixed { .. }));
        match &params[1] {
            Parameter::Choice { values, .. } => assert_eq!(values.len(), 3),
            _ => panic!("expected choice"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(parse_cli_parameters(&tokens("x bogus 1 2")).is_err());
    }

    #[test]
    fn parses_multiple_ranges_without_log_ambiguity() {
        let params = parse_cli_parameters(&tokens("x range 0 1 float y range 0 1 float")).unwrap();
        assert_eq!(params.len(), 2);
    }
}
