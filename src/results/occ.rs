//! Optimization with Combined Criteria (spec §4.7): scalarizes a vector of
//! results into one number for single-score reporting. Formulas and sign
//! rules are ported verbatim from the original source's
//! `calculate_signed_{geometric,harmonic,minkowski}_distance` functions
//! (`examples/original_source/ax/.omniopt.py`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccFormula {
    Euclid,
    Geometric,
    SignedHarmonic,
    Minkowski,
    WeightedEuclidean,
}

impl OccFormula {
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "euclid" => Ok(Self::Euclid),
            "geometric" => Ok(Self::Geometric),
            "signed_harmonic" => Ok(Self::SignedHarmonic),
            "minkowski" | "signed_minkowski" => Ok(Self::Minkowski),
            "weighted_euclid" | "weighted_euclidean" => Ok(Self::WeightedEuclidean),
            other => Err(format!(
                "invalid OCC type '{other}'. Valid types are: geometric, euclid, signed_harmonic, minkowski, weighted_euclidean"
            )),
        }
    }
}

fn sign_any_negative(values: &[f64]) -> f64 {
    if values.iter().any(|v| *v < 0.0) {
        -1.0
    } else {
        1.0
    }
}

fn sign_odd_negative_count(values: &[f64]) -> f64 {
    let negatives = values.iter().filter(|v| **v < 0.0).count();
    if negatives % 2 == 1 {
        -1.0
    } else {
        1.0
    }
}

pub fn euclid(values: &[f64]) -> f64 {
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    sign_any_negative(values) * sum_sq.sqrt()
}

pub fn geometric(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let product: f64 = values.iter().map(|v| v.abs()).product();
    let mean = product.powf(1.0 / values.len() as f64);
    sign_odd_negative_count(values) * mean
}

pub fn signed_harmonic(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let inverse_sum: f64 = values.iter().map(|v| if *v == 0.0 { 0.0 } else { 1.0 / v.abs() }).sum();
    if inverse_sum == 0.0 {
        return 0.0;
    }
    let mean = values.len() as f64 / inverse_sum;
    sign_odd_negative_count(values) * mean
}

pub fn minkowski(values: &[f64], p: f64) -> Result<f64, String> {
    if p <= 0.0 {
        return Err(format!("minkowski_p must be larger than 0, got {p}"));
    }
    let sum: f64 = values.iter().map(|v| v.abs().powf(p)).sum();
    Ok(sign_any_negative(values) * sum.powf(1.0 / p))
}

/// Comma-separated weights; extras are trimmed, missing ones padded with 1
/// (spec §4.7 "Weight parsing").
pub fn parse_weights(spec: &str, n: usize) -> Vec<f64> {
    let mut weights: Vec<f64> = spec
        .split(',')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .collect();
    weights.truncate(n);
    while weights.len() < n {
        weights.push(1.0);
    }
    weights
}

pub fn weighted_euclidean(values: &[f64], weights: &[f64]) -> f64 {
    let sum: f64 = values
        .iter()
        .zip(weights.iter())
        .map(|(v, w)| w * v * v)
        .sum();
    sign_any_negative(values) * sum.sqrt()
}

pub fn evaluate(formula: OccFormula, values: &[f64], minkowski_p: f64, weights: &[f64]) -> Result<f64, String> {
    Ok(match formula {
        OccFormula::Euclid => euclid(values),
        OccFormula::Geometric => geometric(values),
        OccFormula::SignedHarmonic => signed_harmonic(values),
        OccFormula::Minkowski => minkowski(values, minkowski_p)?,
        OccFormula::WeightedEuclidean => weighted_euclidean(values, weights),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometric_matches_reference_values() {
        assert!((geometric(&[0.1]) - 0.1).abs() < 1e-9);
        assert!((geometric(&[-0.1]) + 0.1).abs() < 1e-9);
        assert!((geometric(&[0.1, 0.2]) - 0.141_421_356_237_309_53).abs() < 1e-9);
    }

    #[test]
    fn signed_harmonic_matches_reference_values() {
        assert!((signed_harmonic(&[0.1]) - 0.1).abs() < 1e-9);
        assert!((signed_harmonic(&[-0.1]) + 0.1).abs() < 1e-9);
        assert!((signed_harmonic(&[0.1, 0.2]) - 0.133_333_333_333_333_33).abs() < 1e-6);
    }

    #[test]
    fn minkowski_matches_reference_values() {
        assert!((minkowski(&[0.1], 3.0).unwrap() - 0.100_000_000_000_000_02).abs() < 1e-9);
        assert!((minkowski(&[-0.1], 3.0).unwrap() + 0.100_000_000_000_000_02).abs() < 1e-9);
        assert!((minkowski(&[0.1, 0.2], 3.0).unwrap() - 0.208_008_382_305_190_45).abs() < 1e-9);
    }

    #[test]
    fn minkowski_rejects_nonpositive_p() {
        assert!(minkowski(&[0.1, 0.2], -1.0).is_err());
    }

    #[test]
    fn weight_parsing_pads_and_trims() {
        assert_eq!(parse_weights("1,2", 3), vec![1.0, 2.0, 1.0]);
        assert_eq!(parse_weights("1,2,3,4", 2), vec![1.0, 2.0]);
    }
}
