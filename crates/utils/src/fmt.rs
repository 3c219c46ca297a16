//! Storage-size parsing and formatting.
//!
//! Sizes are written the way admins write them in config files: a bare
//! integer is bytes, a trailing `b`/`k`/`m`/`g`/`t` (case-insensitive)
//! scales by powers of 1024.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid storage size: {0}")]
pub struct ParseSizeError(pub String);

/// Parse a storage-size string to bytes.
pub fn parse_storage_size(s: &str) -> Result<u64, ParseSizeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseSizeError(s.to_string()));
    }
    let (digits, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_digit() => (s, 1u64),
        Some(c) => {
            let scale = match c.to_ascii_lowercase() {
                'b' => 1,
                'k' => 1 << 10,
                'm' => 1 << 20,
                'g' => 1 << 30,
                't' => 1u64 << 40,
                _ => return Err(ParseSizeError(s.to_string())),
            };
            (&s[..s.len() - 1], scale)
        }
        None => return Err(ParseSizeError(s.to_string())),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ParseSizeError(s.to_string()))?;
    value
        .checked_mul(unit)
        .ok_or_else(|| ParseSizeError(s.to_string()))
}

/// Format a byte count in human-readable form.
pub fn format_storage_size(size: u64, precision: usize) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1u64 << 40, "T"),
        (1 << 30, "G"),
        (1 << 20, "M"),
        (1 << 10, "K"),
    ];
    for (scale, suffix) in UNITS {
        if size >= scale {
            return if precision > 0 {
                format!("{:.*}{}", precision, size as f64 / scale as f64, suffix)
            } else {
                format!("{}{}", size / scale, suffix)
            };
        }
    }
    format!("{size}B")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_storage_size("1024"), Ok(1024));
        assert_eq!(parse_storage_size("8g"), Ok(8 << 30));
        assert_eq!(parse_storage_size("512M"), Ok(512 << 20));
        assert_eq!(parse_storage_size("2t"), Ok(2 * (1u64 << 40)));
        assert_eq!(parse_storage_size("100b"), Ok(100));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_storage_size("").is_err());
        assert!(parse_storage_size("g").is_err());
        assert!(parse_storage_size("12x").is_err());
        assert!(parse_storage_size("-1g").is_err());
    }

    #[test]
    fn formats_round_numbers() {
        assert_eq!(format_storage_size(100, 2), "100B");
        assert_eq!(format_storage_size(8 << 30, 0), "8G");
        assert_eq!(format_storage_size(1536, 1), "1.5K");
    }
}
