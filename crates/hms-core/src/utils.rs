//! 通用工具函数

use chrono::Utc;
use rand::Rng;

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// 生成业务编号，格式为 `{prefix}-{YYYYMMDD}-{6位随机码}`
///
/// 用于病历号、就诊号、发票号和支付流水号。唯一性最终由数据库唯一约束保证。
pub fn generate_reference(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, Utc::now().format("%Y%m%d"), suffix)
}

/// 去除首尾空白，空字符串视为未提供
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_reference() {
        let reference = generate_reference("INV");
        let parts: Vec<&str> = reference.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "INV");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_ne!(reference, generate_reference("INV"));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(non_empty(Some(" a ".to_string())), Some("a".to_string()));
        assert_eq!(non_empty(None), None);
    }
}
