use std::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Signed nanosecond timestamp or interval.
///
/// Signed so that back-dated timestamps (`now - timeout - 1`) stay valid
/// arithmetic even when the clock starts near zero, e.g. under a mock.
#[derive(Copy, Clone, Debug, Default, Serialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Nanos(pub i64);

#[derive(Error, Debug)]
#[error("couldn't parse duration {input:?}: {source}")]
pub struct NanosParseError {
    input: String,
    source: humantime::DurationError,
}

impl Nanos {
    pub const MAX: Nanos = Nanos(i64::MAX);
    pub const ZERO: Nanos = Nanos(0);

    #[inline]
    pub const fn from_secs(s: i64) -> Self {
        Nanos(s * 1_000_000_000)
    }

    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        Nanos(ms * 1_000_000)
    }

    #[inline]
    pub const fn from_micros(us: i64) -> Self {
        Nanos(us * 1_000)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    #[inline]
    pub const fn saturating_sub(self, rhs: Nanos) -> Self {
        Nanos(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Nanos {
    type Output = Nanos;

    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 + rhs.0)
    }
}

impl AddAssign for Nanos {
    fn add_assign(&mut self, rhs: Nanos) {
        self.0 += rhs.0
    }
}

impl Sub for Nanos {
    type Output = Nanos;

    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl SubAssign for Nanos {
    fn sub_assign(&mut self, rhs: Nanos) {
        self.0 -= rhs.0
    }
}

impl fmt::Display for Nanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl FromStr for Nanos {
    type Err = NanosParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d = humantime::parse_duration(s)
            .map_err(|source| NanosParseError { input: s.to_string(), source })?;
        Ok(Nanos(d.as_nanos() as i64))
    }
}

/// Accepts either raw nanos (`100000000`) or a humantime string (`"100ms"`).
impl<'de> Deserialize<'de> for Nanos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Human(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(Nanos(n)),
            Raw::Human(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
