// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use anyhow::bail;

const DEC_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    // Lowercase, unlike the larger multipliers.
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];
const BIN_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

/// Parses a Kubernetes resource quantity (`10Gi`, `500M`, `1.5Ti`, `1e3`)
/// into a whole number of units, rounding fractions up the way the API
/// server does for storage requests.
///
/// Negative quantities are rejected.
pub fn parse_quantity(s: &str) -> Result<u64, anyhow::Error> {
    let s = s.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.starts_with('-') {
        bail!("negative quantities are not supported: {s}");
    }

    let split = s
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        bail!("missing number in quantity {s:?}");
    }

    let digits = format!("{whole}{fraction}");
    let mantissa: u128 = digits.parse()?;
    let fraction_digits = u32::try_from(fraction.len())?;
    let mut denominator = 10u128
        .checked_pow(fraction_digits)
        .ok_or_else(|| anyhow::anyhow!("too many fractional digits in {s:?}"))?;

    let mut numerator = mantissa;
    if let Some(exponent) = decimal_exponent(suffix) {
        let scale = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(|| anyhow::anyhow!("quantity {s:?} overflows"))?;
        if exponent >= 0 {
            numerator = numerator
                .checked_mul(scale)
                .ok_or_else(|| anyhow::anyhow!("quantity {s:?} overflows"))?;
        } else {
            denominator = denominator
                .checked_mul(scale)
                .ok_or_else(|| anyhow::anyhow!("quantity {s:?} overflows"))?;
        }
    } else if let Some((_, exponent)) = BIN_SUFFIXES.iter().find(|(target, _)| suffix == *target) {
        numerator = numerator
            .checked_mul(1u128 << exponent)
            .ok_or_else(|| anyhow::anyhow!("quantity {s:?} overflows"))?;
    } else if let Some((_, exponent)) = DEC_SUFFIXES.iter().find(|(target, _)| suffix == *target)
    {
        let scale = 10u128.pow(exponent.unsigned_abs());
        if *exponent >= 0 {
            numerator = numerator
                .checked_mul(scale)
                .ok_or_else(|| anyhow::anyhow!("quantity {s:?} overflows"))?;
        } else {
            denominator *= scale;
        }
    } else {
        bail!("unrecognized suffix {suffix:?} in quantity {s:?}");
    }

    let value = numerator.div_ceil(denominator);
    Ok(u64::try_from(value)?)
}

/// The exponent of a suffix in scientific notation, e.g. `e3` or `E-2`.
/// A bare `E` is the exa multiplier, not an exponent.
fn decimal_exponent(suffix: &str) -> Option<i32> {
    let rest = suffix.strip_prefix(['e', 'E'])?;
    let digits = rest.strip_prefix(['+', '-']).unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_storage_quantities() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 << 30);
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("+42").unwrap(), 42);
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
    }

    #[test]
    fn parses_scientific_notation() {
        assert_eq!(parse_quantity("1e3").unwrap(), 1000);
        assert_eq!(parse_quantity("1E3").unwrap(), 1000);
        assert_eq!(parse_quantity("2.5e+2").unwrap(), 250);
        assert_eq!(parse_quantity("15e-1").unwrap(), 2);
        assert_eq!(parse_quantity("1E").unwrap(), 1_000_000_000_000_000_000);
    }

    #[test]
    fn rejects_malformed_quantities() {
        for bad in ["", "Gi", "-1Gi", "10GB", "1e", "1e3Gi", "1e-", "ten", "1.2.3Gi"] {
            assert!(parse_quantity(bad).is_err(), "{bad:?} should not parse");
        }
    }
}
