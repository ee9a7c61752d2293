//! 金额类型
//!
//! 所有金额以最小货币单位（分）存储，避免浮点误差。
//! JSON 中既接受数字 `80` / `80.5` 也接受字符串 `"80.50"`，输出统一为两位小数字符串。

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};
use std::str::FromStr;

use crate::error::HmsError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn from_major(major: i64) -> Self {
        Self(major * 100)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_mul(self, quantity: i64) -> Option<Money> {
        self.0.checked_mul(quantity).map(Money)
    }

    /// 从 JSON 数字转换，与字符串同样最多两位小数
    ///
    /// 按浮点数的最短十进制表示解析，`80.1` 得到 8010 分，`80.123` 被拒绝而不是四舍五入。
    pub fn from_f64(value: f64) -> Result<Money, HmsError> {
        if !value.is_finite() {
            return Err(HmsError::Validation(format!("invalid amount: {}", value)));
        }
        value.to_string().parse()
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Mul<i64> for Money {
    type Output = Money;

    fn mul(self, rhs: i64) -> Money {
        Money(self.0 * rhs)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = HmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HmsError::Validation(format!("invalid amount: '{}'", s));
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() || frac.len() > 2 {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        let minor = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(invalid)?;

        Ok(Money(if negative { -minor } else { minor }))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MoneyVisitor;

        impl<'de> de::Visitor<'de> for MoneyVisitor {
            type Value = Money;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an amount as a number or a decimal string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Money, E> {
                v.checked_mul(100)
                    .map(Money)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Money, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(100))
                    .map(Money)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Money, E> {
                Money::from_f64(v).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Money, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MoneyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("150.00".parse::<Money>().unwrap(), Money::from_minor(15000));
        assert_eq!("80.5".parse::<Money>().unwrap(), Money::from_minor(8050));
        assert_eq!("70".parse::<Money>().unwrap(), Money::from_major(70));
        assert_eq!(Money::from_minor(7000).to_string(), "70.00");
        assert_eq!(Money::from_minor(-5).to_string(), "-0.05");
    }

    #[test]
    fn test_rejects_malformed_amounts() {
        assert!("1.234".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!(".50".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
    }

    #[test]
    fn test_json_accepts_numbers_and_strings() {
        let from_number: Money = serde_json::from_str("80.00").unwrap();
        let from_int: Money = serde_json::from_str("80").unwrap();
        let from_string: Money = serde_json::from_str("\"80.00\"").unwrap();
        assert_eq!(from_number, Money::from_major(80));
        assert_eq!(from_int, Money::from_major(80));
        assert_eq!(from_string, Money::from_major(80));
        assert_eq!(serde_json::to_string(&Money::from_major(70)).unwrap(), "\"70.00\"");
    }

    #[test]
    fn test_json_number_with_extra_decimals_rejected() {
        assert!(serde_json::from_str::<Money>("80.123").is_err());
        assert!(serde_json::from_str::<Money>("0.004").is_err());
        assert!(serde_json::from_str::<Money>("\"80.123\"").is_err());
        assert_eq!(serde_json::from_str::<Money>("80.1").unwrap(), Money::from_minor(8010));
        assert_eq!(serde_json::from_str::<Money>("0.07").unwrap(), Money::from_minor(7));
        assert_eq!(serde_json::from_str::<Money>("-12.5").unwrap(), Money::from_minor(-1250));
        assert!(Money::from_f64(f64::NAN).is_err());
    }

    #[test]
    fn test_arithmetic() {
        let total = Money::from_major(150);
        let paid = Money::from_major(80);
        assert_eq!(total - paid, Money::from_major(70));
        assert_eq!(Money::from_minor(1250) * 3, Money::from_minor(3750));
        let sum: Money = vec![Money::from_major(1), Money::from_major(2)].into_iter().sum();
        assert_eq!(sum, Money::from_major(3));
    }
}
