//! Instants and system-period intervals.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// An instant in time with microsecond resolution.
///
/// Stored as signed microseconds since the Unix epoch, the same fixed-point
/// step a `timestamptz` column uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Wall-clock now, truncated to whole microseconds.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_micros())
    }

    /// `None` when the instant lies outside chrono's representable range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self::from_datetime(at)
    }
}

impl std::str::FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<DateTime<Utc>>().map(Self::from_datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(at) => write!(f, "{}", at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// A system-period value: empty, or `[lower, upper)` where a missing bound
/// is unbounded on that side.
///
/// Construction through [`Period::new`] canonicalises a range whose finite
/// bounds do not satisfy `lower < upper` to [`Period::Empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    Empty,
    Range {
        lower: Option<Timestamp>,
        upper: Option<Timestamp>,
    },
}

impl Period {
    pub fn new(lower: Option<Timestamp>, upper: Option<Timestamp>) -> Self {
        match (lower, upper) {
            (Some(l), Some(u)) if l >= u => Period::Empty,
            _ => Period::Range { lower, upper },
        }
    }

    /// The period of a live row: `[since, )`.
    pub fn current_from(since: Timestamp) -> Self {
        Period::Range {
            lower: Some(since),
            upper: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Period::Empty)
    }

    pub fn lower(&self) -> Option<Timestamp> {
        match self {
            Period::Empty => None,
            Period::Range { lower, .. } => *lower,
        }
    }

    pub fn upper(&self) -> Option<Timestamp> {
        match self {
            Period::Empty => None,
            Period::Range { upper, .. } => *upper,
        }
    }

    /// Non-empty with an unbounded upper side.
    pub fn is_current(&self) -> bool {
        matches!(self, Period::Range { upper: None, .. })
    }

    /// Half-open containment: `lower <= at < upper`.
    pub fn contains(&self, at: Timestamp) -> bool {
        match self {
            Period::Empty => false,
            Period::Range { lower, upper } => {
                lower.map_or(true, |l| l <= at) && upper.map_or(true, |u| at < u)
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::Empty => write!(f, "empty"),
            Period::Range { lower, upper } => {
                write!(f, "[")?;
                if let Some(l) = lower {
                    write!(f, "\"{l}\"")?;
                }
                write!(f, ",")?;
                if let Some(u) = upper {
                    write!(f, "\"{u}\"")?;
                }
                write!(f, ")")
            }
        }
    }
}
