//! Memory quantity parsing ("4Gi", "512Mi", "1.5G", "1048576")

const BINARY_SUFFIXES: &[(&str, u32)] = &[("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5)];
const DECIMAL_SUFFIXES: &[(&str, u32)] = &[
    ("k", 1),
    ("K", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
];

/// Parse a memory quantity into a positive byte count
pub fn parse_memory(raw: &str) -> Result<u64, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }

    let (number, multiplier) = split_suffix(value);
    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a valid memory quantity", value))?;
    if !number.is_finite() || number <= 0.0 {
        return Err(format!("'{}' must be a positive quantity", value));
    }

    let bytes = (number * multiplier).round();
    if bytes < 1.0 {
        return Err(format!("'{}' is less than one byte", value));
    }
    if bytes >= u64::MAX as f64 {
        return Err(format!("'{}' is too large", value));
    }
    Ok(bytes as u64)
}

fn split_suffix(value: &str) -> (&str, f64) {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return (number, 1024f64.powi(*power as i32));
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return (number, 1000f64.powi(*power as i32));
        }
    }
    (value, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(parse_memory("4Gi"), Ok(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512Mi"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_memory(" 1Ki "), Ok(1024));
    }

    #[test]
    fn test_decimal_suffixes_and_bare_bytes() {
        assert_eq!(parse_memory("2G"), Ok(2_000_000_000));
        assert_eq!(parse_memory("3k"), Ok(3_000));
        assert_eq!(parse_memory("1048576"), Ok(1_048_576));
    }

    #[test]
    fn test_fractional_values() {
        assert_eq!(parse_memory("1.5Gi"), Ok(1_610_612_736));
        assert_eq!(parse_memory("0.5Ki"), Ok(512));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("Gi").is_err());
        assert!(parse_memory("4GB").is_err());
        assert!(parse_memory("-1Gi").is_err());
        assert!(parse_memory("0").is_err());
        assert!(parse_memory("NaN").is_err());
        assert!(parse_memory("0.1").is_err());
    }
}
