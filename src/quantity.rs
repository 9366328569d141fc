//! Kubernetes resource-quantity parsing.
//!
//! Capacity fields accept a plain integer byte count, a decimal number with
//! a binary (`Ki`..`Ei`) or decimal (`n`..`E`) SI suffix, or scientific
//! notation. Fractional byte results are resolved with an explicit rounding
//! mode: minimums round down, maximums round up.

use crate::error::Error;

/// How to resolve a fractional byte count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    Floor,
    Ceiling,
    HalfEven,
}

/// Parse a quantity (string or integer JSON value) and round to whole bytes.
pub fn parse_quantity_value(value: &serde_json::Value, rounding: Rounding) -> Result<i64, Error> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::Quantity(format!("{n} is not a whole number"))),
        serde_json::Value::String(s) => parse_quantity(s, rounding),
        other => Err(Error::Quantity(format!(
            "expected a string or integer, got {other}"
        ))),
    }
}

/// Parse a quantity string and round to whole bytes.
pub fn parse_quantity(input: &str, rounding: Rounding) -> Result<i64, Error> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Quantity("empty quantity".into()));
    }

    let invalid = || Error::Quantity(format!("cannot parse quantity {input:?}"));

    let (s, negative) = match s.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (s.strip_prefix('+').unwrap_or(s), false),
    };

    // split number from suffix
    let number_len = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_len);

    if number.is_empty() {
        return Err(invalid());
    }

    // mantissa as integer plus decimal scale
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }

    let digits = format!("{int_part}{frac_part}");
    let mantissa: i128 = digits.parse().map_err(|_| invalid())?;
    let mantissa = if negative { -mantissa } else { mantissa };

    let (num, den) = suffix_factors(suffix).ok_or_else(invalid)?;

    let den = pow10(frac_part.len() as u32)
        .and_then(|scale| den.checked_mul(scale))
        .ok_or_else(invalid)?;

    let scaled = mantissa.checked_mul(num).ok_or_else(invalid)?;
    let bytes = divide_rounded(scaled, den, rounding);

    i64::try_from(bytes).map_err(|_| Error::Quantity(format!("{input:?} overflows i64")))
}

/// Numerator and denominator for a quantity suffix.
fn suffix_factors(suffix: &str) -> Option<(i128, i128)> {
    Some(match suffix {
        "" => (1, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => {
            // scientific notation: e.g. "e3", "E-2"
            let exp: i32 = suffix
                .strip_prefix(['e', 'E'])?
                .parse()
                .ok()
                .filter(|e: &i32| e.unsigned_abs() <= 38)?;
            if exp >= 0 {
                (pow10(exp as u32)?, 1)
            } else {
                (1, pow10(exp.unsigned_abs())?)
            }
        }
    })
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

fn divide_rounded(numerator: i128, denominator: i128, rounding: Rounding) -> i128 {
    debug_assert!(denominator > 0);
    let quotient = numerator.div_euclid(denominator);
    let remainder = numerator.rem_euclid(denominator);
    if remainder == 0 {
        return quotient;
    }
    match rounding {
        Rounding::Floor => quotient,
        Rounding::Ceiling => quotient + 1,
        Rounding::HalfEven => {
            let twice = remainder * 2;
            if twice > denominator || (twice == denominator && quotient % 2 != 0) {
                quotient + 1
            } else {
                quotient
            }
        }
    }
}
