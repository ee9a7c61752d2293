//! 手机号规范化
//!
//! 移动支付渠道只接受 `255XXXXXXXXX` 形式的坦桑尼亚手机号。

use hms_core::{HmsError, Result};
use regex::Regex;
use std::sync::OnceLock;

fn mobile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^255[67]\d{8}$").expect("valid phone pattern"))
}

fn separators() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\s\-().]").expect("valid separator pattern"))
}

/// 规范化为 `255XXXXXXXXX`
///
/// 接受 `+255...`、`255...`、`0...` 以及省略前缀的 9 位号码。
pub fn normalize_phone(input: &str) -> Result<String> {
    let compact = separators().replace_all(input.trim(), "");
    let digits = compact.strip_prefix('+').unwrap_or(&compact);

    let normalized = if digits.starts_with("255") {
        digits.to_string()
    } else if let Some(local) = digits.strip_prefix('0') {
        format!("255{}", local)
    } else if digits.len() == 9 {
        format!("255{}", digits)
    } else {
        digits.to_string()
    };

    if mobile_pattern().is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(HmsError::Validation(format!("invalid mobile number: '{}'", input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_forms() {
        for input in ["0712345678", "+255712345678", "255712345678", "712345678", "0712 345 678", "(+255) 712-345-678"] {
            assert_eq!(normalize_phone(input).unwrap(), "255712345678", "input {}", input);
        }
        assert_eq!(normalize_phone("0655000111").unwrap(), "255655000111");
    }

    #[test]
    fn test_rejected_forms() {
        for input in ["", "12345", "0812345678", "25571234567", "2557123456789", "07123abc78", "+1 202 555 0100"] {
            assert!(normalize_phone(input).is_err(), "input {}", input);
        }
    }
}
