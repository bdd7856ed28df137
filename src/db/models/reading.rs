//! Sensor reading data model.
//!
//! A reading is one timestamped sample vector from one sensor. Vector length
//! varies per reading and per sensor, but is never zero.

use std::fmt;

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::helpers::parse_millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub sensor: String,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
}

impl Reading {
    pub fn new(sensor: impl Into<String>, timestamp: DateTime<Utc>, values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            bail!("a reading needs at least one value");
        }

        Ok(Self {
            sensor: sensor.into(),
            timestamp,
            values,
        })
    }

    pub fn from_millis(sensor: impl Into<String>, timestamp_ms: i64, values: Vec<f64>) -> Result<Self> {
        Self::new(sensor, parse_millis(timestamp_ms, "timestamp")?, values)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} {:?}",
            self.sensor,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.values
        )
    }
}

/// Stable sort by timestamp; readings with equal timestamps keep insertion order.
pub fn sort_by_time(readings: &mut [Reading]) {
    readings.sort_by_key(|reading| reading.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_vectors() {
        assert!(Reading::from_millis("hr", 0, Vec::new()).is_err());
    }

    #[test]
    fn display_includes_sensor_time_and_values() {
        let reading = Reading::from_millis("accel", 1_000, vec![1.0, 2.5]).unwrap();
        assert_eq!(reading.to_string(), "accel @ 1970-01-01T00:00:01.000Z [1.0, 2.5]");
    }

    #[test]
    fn sort_keeps_insertion_order_for_ties() {
        let mut readings = vec![
            Reading::from_millis("b", 20, vec![1.0]).unwrap(),
            Reading::from_millis("first", 10, vec![1.0]).unwrap(),
            Reading::from_millis("second", 10, vec![2.0]).unwrap(),
        ];
        sort_by_time(&mut readings);

        let sensors: Vec<_> = readings.iter().map(|r| r.sensor.as_str()).collect();
        assert_eq!(sensors, ["first", "second", "b"]);
    }
}
