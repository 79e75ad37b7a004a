//! A [`Duration`] able to parse and render human-readable forms like
//! `365d`, `24h` or `1h 30m`, used for certificate validity windows,
//! rotation margins and restart timeouts.
//!
//! It derefs to [`std::time::Duration`], so all of the standard
//! functionality is available without re-implementation.

use std::{
    fmt::{Display, Write},
    num::ParseIntError,
    ops::{Add, Deref, Sub},
    str::FromStr,
};

use serde::{Deserialize, Serialize, de::Visitor};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

const SECONDS_FACTOR: u64 = 1;
const MINUTES_FACTOR: u64 = SECONDS_FACTOR * 60;
const HOURS_FACTOR: u64 = MINUTES_FACTOR * 60;
const DAYS_FACTOR: u64 = HOURS_FACTOR * 24;
const WEEKS_FACTOR: u64 = DAYS_FACTOR * 7;

#[derive(Debug, PartialEq, Snafu)]
pub enum DurationParseError {
    #[snafu(display("empty input"))]
    EmptyInput,

    #[snafu(display("invalid fragment {fragment:?}, expected <number><unit>"))]
    InvalidFragment { fragment: String },

    #[snafu(display("failed to parse {value:?} as a number"))]
    InvalidValue {
        source: ParseIntError,
        value: String,
    },

    #[snafu(display("unknown unit {unit:?}"))]
    InvalidUnit { unit: String },

    #[snafu(display("duration overflows"))]
    Overflow,
}

/// A duration with second granularity and a human-readable string form.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl FromStr for Duration {
    type Err = DurationParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        ensure!(!input.is_empty(), EmptyInputSnafu);

        let mut seconds = 0u64;

        for fragment in input.split_ascii_whitespace() {
            let unit_start = fragment
                .find(|c: char| !c.is_ascii_digit())
                .context(InvalidFragmentSnafu { fragment })?;
            let (value, unit) = fragment.split_at(unit_start);
            ensure!(!value.is_empty(), InvalidFragmentSnafu { fragment });

            let value = value.parse::<u64>().context(InvalidValueSnafu { value })?;
            let factor = match unit {
                "s" => SECONDS_FACTOR,
                "m" => MINUTES_FACTOR,
                "h" => HOURS_FACTOR,
                "d" => DAYS_FACTOR,
                "w" => WEEKS_FACTOR,
                _ => return InvalidUnitSnafu { unit }.fail(),
            };

            seconds = value
                .checked_mul(factor)
                .and_then(|v| seconds.checked_add(v))
                .context(OverflowSnafu)?;
        }

        Ok(Self(std::time::Duration::from_secs(seconds)))
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_zero() {
            return write!(f, "0s");
        }

        let mut secs = self.0.as_secs();
        let mut formatted = String::new();

        for (factor, unit) in [
            (WEEKS_FACTOR, "w"),
            (DAYS_FACTOR, "d"),
            (HOURS_FACTOR, "h"),
            (MINUTES_FACTOR, "m"),
            (SECONDS_FACTOR, "s"),
        ] {
            let whole = secs / factor;
            secs %= factor;

            if whole > 0 {
                write!(formatted, "{whole}{unit} ")?;
            }
        }

        f.write_str(formatted.trim_end())
    }
}

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_minutes(minutes: u64) -> Self {
        Self::from_secs(minutes * MINUTES_FACTOR)
    }

    pub const fn from_hours(hours: u64) -> Self {
        Self::from_secs(hours * HOURS_FACTOR)
    }

    pub const fn from_days(days: u64) -> Self {
        Self::from_secs(days * DAYS_FACTOR)
    }

    /// The same span as a [`chrono::TimeDelta`], for arithmetic against
    /// annotation timestamps. Saturates at the chrono maximum.
    pub fn as_chrono(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::from_std(self.0).unwrap_or(chrono::TimeDelta::MAX)
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a duration string like \"365d\" or \"1h 30m\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(DurationVisitor)
    }
}
