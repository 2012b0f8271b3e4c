use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;
use serde::de::Deserializer;
use serde::ser::Serializer;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// A wall-clock time of day, ordered lexicographically on (hour, minute, second).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self> {
        let t = Self {
            hour,
            minute,
            second,
        };
        t.validate()?;
        Ok(t)
    }

    fn validate(self) -> Result<()> {
        if self.hour > 23 {
            bail!("invalid hour for time of day: {}", self.hour);
        }
        if self.minute > 59 {
            bail!("invalid minute for time of day: {}", self.minute);
        }
        if self.second > 59 {
            bail!("invalid second for time of day: {}", self.second);
        }
        Ok(())
    }
}

impl From<OffsetDateTime> for TimeOfDay {
    fn from(t: OffsetDateTime) -> Self {
        Self {
            hour: t.hour(),
            minute: t.minute(),
            second: t.second(),
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

impl FromStr for TimeOfDay {
    type Err = anyhow::Error;

    /// Accepts `HH:MM` or `HH:MM:SS`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            bail!("invalid time of day, expected hh:mm or hh:mm:ss: {s}");
        }
        let hour: u8 = parts[0]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid hour {:?} in {s}", parts[0]))?;
        let minute: u8 = parts[1]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid minute {:?} in {s}", parts[1]))?;
        let second: u8 = match parts.get(2) {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid second {raw:?} in {s}"))?,
            None => 0,
        };
        Self::new(hour, minute, second)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A half-open-on-both-ends clock window: `begin < t < end`.
///
/// Ranges that would cross midnight (`begin >= end`) are rejected when
/// parsed, so a rule can never be configured in a way that silently never
/// matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub begin: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeRange {
    pub fn new(begin: TimeOfDay, end: TimeOfDay) -> Result<Self> {
        if begin >= end {
            bail!("time range must satisfy begin < end within one day: {begin} - {end}");
        }
        Ok(Self { begin, end })
    }

    /// Strict membership: boundary instants are outside the range.
    pub fn contains(&self, t: TimeOfDay) -> bool {
        self.begin < t && t < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.begin, self.end)
    }
}

impl FromStr for TimeRange {
    type Err = anyhow::Error;

    /// Accepts `"HH:MM[:SS] - HH:MM[:SS]"`; whitespace around the separator
    /// is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let Some((begin, end)) = s.split_once('-') else {
            bail!("invalid time range, expected \"hh:mm - hh:mm\": {s}");
        };
        Self::new(begin.trim().parse()?, end.trim().parse()?)
    }
}

impl Serialize for TimeRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Local wall clock, falling back to UTC when the local offset cannot be
/// determined (e.g. multi-threaded environments on some unix platforms).
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
