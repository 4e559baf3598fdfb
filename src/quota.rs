use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Keyword used for the unlimited sentinel in config and state files
const UNLIMITED: &str = "unlimited";

/// A data (bytes) or time (seconds) allowance.
///
/// `Unlimited` is absorbing: crediting anything to it, or debiting anything
/// from it, leaves it unlimited. Limited amounts never go below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Limited(u64),
    Unlimited,
}

impl Allowance {
    pub const ZERO: Allowance = Allowance::Limited(0);

    /// Additive credit, saturating at the unlimited sentinel
    pub fn credit(self, other: Allowance) -> Allowance {
        match (self, other) {
            (Allowance::Limited(a), Allowance::Limited(b)) => {
                a.checked_add(b).map(Allowance::Limited).unwrap_or(Allowance::Unlimited)
            }
            _ => Allowance::Unlimited,
        }
    }

    /// Subtractive debit, floored at zero
    pub fn debit(self, amount: u64) -> Allowance {
        match self {
            Allowance::Limited(a) => Allowance::Limited(a.saturating_sub(amount)),
            Allowance::Unlimited => Allowance::Unlimited,
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, Allowance::Unlimited)
    }

    /// True when a limited allowance has reached zero
    pub fn is_exhausted(self) -> bool {
        self == Allowance::ZERO
    }

    /// Remaining amount, or `None` when unlimited
    pub fn remaining(self) -> Option<u64> {
        match self {
            Allowance::Limited(a) => Some(a),
            Allowance::Unlimited => None,
        }
    }

    /// Human readable form, treating the amount as bytes
    pub fn display_bytes(self) -> String {
        match self {
            Allowance::Limited(bytes) => format_data_size(bytes),
            Allowance::Unlimited => UNLIMITED.to_string(),
        }
    }

    /// Human readable form, treating the amount as seconds
    pub fn display_duration(self) -> String {
        match self {
            Allowance::Limited(secs) => format_time_duration(secs),
            Allowance::Unlimited => UNLIMITED.to_string(),
        }
    }
}

impl Default for Allowance {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Serialize for Allowance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Allowance::Limited(amount) => serializer.serialize_u64(*amount),
            Allowance::Unlimited => serializer.serialize_str(UNLIMITED),
        }
    }
}

impl<'de> Deserialize<'de> for Allowance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AllowanceVisitor;

        impl Visitor<'_> for AllowanceVisitor {
            type Value = Allowance;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Allowance, E> {
                Ok(Allowance::Limited(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Allowance, E> {
                u64::try_from(v)
                    .map(Allowance::Limited)
                    .map_err(|_| E::custom(format!("allowance cannot be negative (got {})", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Allowance, E> {
                if v.eq_ignore_ascii_case(UNLIMITED) {
                    Ok(Allowance::Unlimited)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(AllowanceVisitor)
    }
}

/// Cumulative usage of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub data_bytes: u64,
    pub time_seconds: u64,
}

impl Usage {
    pub fn add(&mut self, data_bytes: u64, time_seconds: u64) {
        self.data_bytes = self.data_bytes.saturating_add(data_bytes);
        self.time_seconds = self.time_seconds.saturating_add(time_seconds);
    }
}

/// Whole seconds elapsed between two instants; zero if the clock went backwards
pub fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

/// Byte delta between two readings of a cumulative counter.
///
/// A reading below the previous one means the counter was reset, in which
/// case the whole new reading is usage since the reset.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// Format bytes to human readable format
pub fn format_data_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

/// Format seconds to human readable format
pub fn format_time_duration(seconds: u64) -> String {
    let minutes = seconds / 60;
    if seconds < 60 {
        format!("{}s", seconds)
    } else if minutes < 60 {
        format!("{} min", minutes)
    } else if minutes < 1440 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{}d {}h", minutes / 1440, (minutes % 1440) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn credit_adds_limited_amounts() {
        let a = Allowance::Limited(100).credit(Allowance::Limited(50));
        assert_eq!(a, Allowance::Limited(150));
    }

    #[test]
    fn credit_saturates_at_unlimited() {
        assert_eq!(
            Allowance::Limited(u64::MAX).credit(Allowance::Limited(1)),
            Allowance::Unlimited
        );
        assert_eq!(
            Allowance::Limited(5).credit(Allowance::Unlimited),
            Allowance::Unlimited
        );
        assert_eq!(
            Allowance::Unlimited.credit(Allowance::Limited(5)),
            Allowance::Unlimited
        );
    }

    #[test]
    fn debit_floors_at_zero() {
        let a = Allowance::Limited(50).debit(100);
        assert_eq!(a, Allowance::ZERO);
        assert!(a.is_exhausted());
    }

    #[test]
    fn unlimited_never_exhausts() {
        let a = Allowance::Unlimited.debit(u64::MAX);
        assert!(a.is_unlimited());
        assert!(!a.is_exhausted());
        assert_eq!(a.remaining(), None);
    }

    #[test]
    fn allowance_deserializes_number_or_keyword() {
        let limited: Allowance = serde_yaml::from_str("1024").unwrap();
        assert_eq!(limited, Allowance::Limited(1024));

        let unlimited: Allowance = serde_yaml::from_str("unlimited").unwrap();
        assert_eq!(unlimited, Allowance::Unlimited);

        let json: Allowance = serde_json::from_str("\"Unlimited\"").unwrap();
        assert_eq!(json, Allowance::Unlimited);
    }

    #[test]
    fn allowance_rejects_negative_and_garbage() {
        assert!(serde_json::from_str::<Allowance>("-5").is_err());
        assert!(serde_yaml::from_str::<Allowance>("lots").is_err());
    }

    #[test]
    fn allowance_serializes_to_number_or_keyword() {
        assert_eq!(serde_json::to_string(&Allowance::Limited(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&Allowance::Unlimited).unwrap(),
            "\"unlimited\""
        );
    }

    #[test]
    fn elapsed_seconds_truncates_and_clamps() {
        let start = Utc::now();
        assert_eq!(elapsed_seconds(start, start + Duration::milliseconds(61_900)), 61);
        assert_eq!(elapsed_seconds(start, start - Duration::seconds(30)), 0);
    }

    #[test]
    fn counter_delta_handles_reset() {
        assert_eq!(counter_delta(100, 250), 150);
        assert_eq!(counter_delta(100, 100), 0);
        assert_eq!(counter_delta(500, 40), 40);
    }

    #[test]
    fn usage_add_saturates() {
        let mut usage = Usage {
            data_bytes: u64::MAX - 1,
            time_seconds: 10,
        };
        usage.add(5, 20);
        assert_eq!(usage.data_bytes, u64::MAX);
        assert_eq!(usage.time_seconds, 30);
    }

    #[test]
    fn test_format_data_size() {
        assert_eq!(format_data_size(512), "512 B");
        assert_eq!(format_data_size(1536), "1.50 KB");
        assert_eq!(format_data_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_data_size(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_time_duration() {
        assert_eq!(format_time_duration(45), "45s");
        assert_eq!(format_time_duration(300), "5 min");
        assert_eq!(format_time_duration(5400), "1h 30m");
        assert_eq!(format_time_duration(2 * 86400 + 3 * 3600), "2d 3h");
    }
}
