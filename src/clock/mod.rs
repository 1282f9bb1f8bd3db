//! Hybrid logical clock
//!
//! Timestamps combine a wall-clock millisecond reading with a logical
//! counter and a node identifier. Every call to [`HlcClock::now`] on a node
//! returns a strictly larger value than the previous call, and observing
//! timestamps received from other nodes keeps the ordering monotone across
//! the whole system. Aggregate ids and event timestamps are both HLC values.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RuntimeError, RuntimeResult};

/// A hybrid logical clock reading
///
/// Ordering is `(millis, counter, node)`, so ties on physical time are
/// broken by the logical counter and then by the node identifier. The text
/// encoding is fixed-width hex, which makes the string form sort the same
/// way as the value and therefore usable as a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    millis: u64,
    counter: u16,
    node: u16,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        millis: 0,
        counter: 0,
        node: 0,
    };

    pub fn new(millis: u64, counter: u16, node: u16) -> Self {
        Self {
            millis,
            counter,
            node,
        }
    }

    /// Wall-clock component, in milliseconds since the Unix epoch
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Logical counter component
    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Identifier of the node that issued this timestamp
    pub fn node(&self) -> u16 {
        self.node
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:012x}-{:04x}-{:04x}",
            self.millis, self.counter, self.node
        )
    }
}

/// Error parsing the text encoding of a [`Timestamp`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid timestamp encoding: {0}")]
pub struct ParseTimestampError(String);

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.splitn(3, '-');
        let millis = parts.next().and_then(|p| u64::from_str_radix(p, 16).ok());
        let counter = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());
        let node = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());

        match (millis, counter, node) {
            (Some(millis), Some(counter), Some(node)) => Ok(Self {
                millis,
                counter,
                node,
            }),
            _ => Err(ParseTimestampError(text.to_string())),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Process-wide hybrid logical clock
///
/// The `(millis, counter)` pair only ever moves forward: a wall clock that
/// stalls or steps backwards advances the counter instead, and counter
/// saturation rolls over into the next millisecond.
#[derive(Debug)]
pub struct HlcClock {
    node: u16,
    last: Mutex<(u64, u16)>,
}

impl HlcClock {
    pub fn new(node: u16) -> Self {
        Self {
            node,
            last: Mutex::new((0, 0)),
        }
    }

    pub fn node(&self) -> u16 {
        self.node
    }

    /// Issue the next timestamp; strictly greater than every earlier one
    pub fn now(&self) -> RuntimeResult<Timestamp> {
        let wall = wall_millis()?;
        let mut last = self.last.lock().expect("clock mutex poisoned");

        let (millis, counter) = if wall > last.0 {
            (wall, 0)
        } else if last.1 == u16::MAX {
            (last.0 + 1, 0)
        } else {
            (last.0, last.1 + 1)
        };

        *last = (millis, counter);
        Ok(Timestamp {
            millis,
            counter,
            node: self.node,
        })
    }

    /// Merge a timestamp seen from another node
    ///
    /// After observing `remote`, every subsequent [`now`](Self::now) result
    /// compares greater than it.
    pub fn observe(&self, remote: Timestamp) {
        let mut last = self.last.lock().expect("clock mutex poisoned");
        if (remote.millis, remote.counter) > *last {
            *last = (remote.millis, remote.counter);
        }
    }
}

fn wall_millis() -> RuntimeResult<u64> {
    u64::try_from(Utc::now().timestamp_millis()).map_err(|_| {
        RuntimeError::ClockFailure("wall clock reads before the Unix epoch".to_string())
    })
}
