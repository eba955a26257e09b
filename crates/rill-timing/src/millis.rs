use std::{
    ops::{Add, AddAssign, Sub, SubAssign},
    str::FromStr,
};

use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};
use serde::{Deserializer, Serialize};

use crate::global_clock;

/// Milliseconds since the process clock epoch.
///
/// Only deltas are meaningful; the runtime never compares these against
/// wall-clock timestamps.
#[derive(Copy, Clone, Debug, Default, Serialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Millis(pub u64);

impl Millis {
    pub const MAX: Millis = Millis(u64::MAX);
    pub const ZERO: Millis = Millis(0);

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Millis(s * 1_000)
    }

    #[inline]
    pub const fn from_mins(m: u64) -> Self {
        Millis(m * 60 * 1_000)
    }

    #[inline]
    pub fn now() -> Self {
        global_clock().now()
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_secs(self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Millis) -> Self {
        Millis(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn elapsed_since(self, since: Millis) -> Millis {
        self.saturating_sub(since)
    }
}

impl std::fmt::Display for Millis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self < Millis::from_secs(1) {
            write!(f, "{}ms", self.0)
        } else if *self < Millis::from_mins(1) {
            write!(f, "{}s", self.0 as f64 / 1_000.0)
        } else {
            let mins = self.0 / 60_000;
            write!(f, "{:0>2}m:{}", mins, Millis(self.0 - mins * 60_000))
        }
    }
}

impl From<u64> for Millis {
    #[inline]
    fn from(value: u64) -> Self {
        Millis(value)
    }
}

impl From<Millis> for u64 {
    #[inline]
    fn from(value: Millis) -> Self {
        value.0
    }
}

impl From<Millis> for std::time::Duration {
    #[inline]
    fn from(value: Millis) -> Self {
        std::time::Duration::from_millis(value.0)
    }
}

impl Add for Millis {
    type Output = Millis;

    #[inline]
    fn add(self, rhs: Millis) -> Millis {
        Millis(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Millis {
    #[inline]
    fn add_assign(&mut self, rhs: Millis) {
        *self = *self + rhs;
    }
}

impl Sub for Millis {
    type Output = Millis;

    #[inline]
    fn sub(self, rhs: Millis) -> Millis {
        Millis(self.0 - rhs.0)
    }
}

impl SubAssign for Millis {
    #[inline]
    fn sub_assign(&mut self, rhs: Millis) {
        *self = *self - rhs;
    }
}

impl FromStr for Millis {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<HumanDuration>() {
            Ok(duration) => {
                let std_duration: std::time::Duration = duration.into();
                Ok(Millis(std_duration.as_millis() as u64))
            }
            Err(err) => Err(err),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Millis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct MillisVisitor;

        impl<'de> Visitor<'de> for MillisVisitor {
            type Value = Millis;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("An integer or a string with optional suffix (s, ms, ...)")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Millis(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom(format!("Millis cannot be negative, got {}", value)));
                }
                Ok(Millis(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Millis::from_str(value).map_err(|e| {
                    E::custom(format!("Failed to parse time value '{}' as duration: {}", value, e))
                })
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_any(MillisVisitor)
        } else {
            u64::deserialize(deserializer).map(Millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_from_string_seconds() {
        let result: Millis = serde_json::from_str(r#""10s""#).unwrap();
        assert_eq!(result, Millis::from_secs(10));
    }

    #[test]
    fn test_millis_from_string_milliseconds() {
        let result: Millis = serde_json::from_str(r#""1500ms""#).unwrap();
        assert_eq!(result, Millis(1_500));
    }

    #[test]
    fn test_millis_from_number() {
        let result: Millis = serde_json::from_str(r#"250"#).unwrap();
        assert_eq!(result, Millis(250));
    }

    #[test]
    fn test_saturating_sub_floors_at_zero() {
        assert_eq!(Millis(5).saturating_sub(Millis(9)), Millis::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(Millis(999).to_string(), "999ms");
        assert_eq!(Millis(1_500).to_string(), "1.5s");
    }
}
