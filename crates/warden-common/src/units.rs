use crate::error::{Error, Result};

/// Parses a byte size with an optional binary K/M/G suffix, upper or lower
/// case. A bare number is taken as bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(Error::InvalidValue(format!("bad size {s:?}")));
    }
    let value: u64 = s[..digits_end]
        .parse()
        .map_err(|_| Error::InvalidValue(format!("bad size {s:?}")))?;
    let shift = match &s[digits_end..] {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        suffix => {
            return Err(Error::InvalidValue(format!(
                "bad size suffix {suffix:?} in {s:?}"
            )))
        }
    };
    value
        .checked_shl(shift)
        .filter(|shifted| shifted >> shift == value)
        .ok_or_else(|| Error::InvalidValue(format!("size {s:?} overflows")))
}

/// Formats a byte count back with the largest exact binary suffix.
pub fn format_size(bytes: u64) -> String {
    for (shift, suffix) in [(30, "G"), (20, "M"), (10, "K")] {
        if bytes != 0 && bytes % (1u64 << shift) == 0 {
            return format!("{}{}", bytes >> shift, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("64m").unwrap(), 64 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("512k").unwrap(), 512 << 10);
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "M", "12X", "1.5G", "-1", "12MB"] {
            assert!(parse_size(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_size("18446744073709551615G").is_err());
    }

    #[test]
    fn round_trips_through_format() {
        for size in ["64M", "3G", "512K", "1000"] {
            let parsed = parse_size(size).unwrap();
            assert_eq!(parse_size(&format_size(parsed)).unwrap(), parsed);
        }
        assert_eq!(format_size(64 << 20), "64M");
        assert_eq!(format_size(1000), "1000");
    }
}
