//! Byte quantity helpers
//!
//! Parsing of Kubernetes resource quantities into byte counts, storage
//! sizing with headroom, and human-readable rendering.

use crate::{Error, Result};

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

const DISPLAY_UNITS: [(&str, i64); 7] = [
    ("EiB", 1 << 60),
    ("PiB", 1 << 50),
    ("TiB", 1 << 40),
    ("GiB", 1 << 30),
    ("MiB", 1 << 20),
    ("KiB", 1 << 10),
    ("B", 1),
];

/// Parse a Kubernetes quantity (`10Gi`, `500M`, `1.5Ti`, `1e9`, `1024`) into bytes.
///
/// Fractional results are rounded up to the next whole byte, matching how
/// the API server interprets storage requests.
pub fn parse_quantity_bytes(input: &str) -> Result<i64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::validation("quantity is empty"));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let number = number.strip_prefix('+').unwrap_or(number);
    if number.starts_with('-') {
        return Err(Error::validation(format!("quantity {input} is negative")));
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::validation(format!("invalid quantity: {input}")));
    }

    let digits = format!("{int_part}{frac_part}");
    let mantissa: u128 = digits
        .trim_start_matches('0')
        .parse::<u128>()
        .or_else(|e| if digits.chars().all(|c| c == '0') { Ok(0) } else { Err(e) })
        .map_err(|_| Error::validation(format!("quantity {input} is out of range")))?;
    let scale = u32::try_from(frac_part.len())
        .map_err(|_| Error::validation(format!("quantity {input} has too many digits")))?;

    let multiplier = suffix_multiplier(suffix)
        .ok_or_else(|| Error::validation(format!("unsupported quantity suffix in {input}")))?;

    let divisor = 10u128
        .checked_pow(scale)
        .ok_or_else(|| Error::validation(format!("quantity {input} has too many digits")))?;
    let scaled = mantissa
        .checked_mul(multiplier)
        .ok_or_else(|| Error::validation(format!("quantity {input} is out of range")))?;
    let bytes = scaled.div_ceil(divisor);

    i64::try_from(bytes).map_err(|_| Error::validation(format!("quantity {input} is out of range")))
}

fn suffix_multiplier(suffix: &str) -> Option<u128> {
    if suffix.is_empty() {
        return Some(1);
    }
    if let Some((_, exp)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return 1024u128.checked_pow(*exp);
    }
    if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return 1000u128.checked_pow(*exp);
    }
    // Scientific notation: 1e9 / 1E9
    let exp = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let exp: u32 = exp.strip_prefix('+').unwrap_or(exp).parse().ok()?;
    10u128.checked_pow(exp)
}

/// Storage request for `bytes` of data plus `headroom_percent` extra.
///
/// Computes `ceil(bytes * (100 + headroom) / 100)`. Negative headroom is
/// treated as zero; the result saturates at `i64::MAX`.
pub fn storage_with_headroom(bytes: i64, headroom_percent: i32) -> i64 {
    let bytes = u128::try_from(bytes.max(0)).unwrap_or(0);
    let pct = u128::try_from(headroom_percent.max(0)).unwrap_or(0);
    let total = (bytes * (100 + pct)).div_ceil(100);
    i64::try_from(total).unwrap_or(i64::MAX)
}

/// Render a byte count with binary units and roughly two significant figures.
///
/// `0` is `"0 B"`, values of 100 or more in their unit are integers
/// (`"150 GiB"`), smaller values keep one decimal when it is non-zero
/// (`"1.5 TiB"`, `"42 GiB"`).
pub fn format_bytes_human_readable(bytes: i64) -> Result<String> {
    if bytes < 0 {
        return Err(Error::validation(format!(
            "cannot format negative size {bytes}"
        )));
    }
    if bytes == 0 {
        return Ok("0 B".to_string());
    }

    for (suffix, size) in DISPLAY_UNITS {
        if bytes >= size {
            let value = bytes as f64 / size as f64;
            return Ok(format_two_sig_figs(value, suffix));
        }
    }

    Ok(format!("{bytes} B"))
}

fn format_two_sig_figs(value: f64, suffix: &str) -> String {
    if value >= 100.0 {
        return format!("{:.0} {suffix}", value.round());
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{rounded:.0} {suffix}")
    } else {
        format!("{rounded:.1} {suffix}")
    }
}
