//! Row-oriented text export of reading histories.
//!
//! Every row is `uid, sensor, date, v0, v1, ...`, so row width follows the
//! length of each reading's vector.

use std::io::Write;

use chrono::SecondsFormat;
use clap::ValueEnum;
use csv::{QuoteStyle, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::db::Reading;
use crate::registry::WatchSnapshot;

const HEADER: [&str; 4] = ["Watch UID", "Sensor", "Date", "Data..."];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Tsv,
    Csv,
}

impl ExportFormat {
    pub fn delimiter(self) -> u8 {
        match self {
            ExportFormat::Tsv => b'\t',
            ExportFormat::Csv => b',',
        }
    }
}

/// Instant as written to exports, e.g. `2024-05-01T10:00:00.000Z`.
pub fn format_date(reading: &Reading) -> String {
    reading
        .timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Shortest round-trip form that keeps a decimal point (`1.0`, `2.5`).
pub fn format_value(value: f64) -> String {
    format!("{value:?}")
}

/// Write the header and one row per reading. Watches appear in the given
/// order; each snapshot is expected to be sorted by time already.
///
/// Fields holding the delimiter, a quote or a line break are quoted with
/// embedded quotes doubled, in both formats.
pub fn render<W: Write>(
    watches: &[WatchSnapshot],
    format: ExportFormat,
    out: &mut W,
) -> csv::Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(format.delimiter())
        .quote_style(QuoteStyle::Necessary)
        .flexible(true)
        .from_writer(out);

    writer.write_record(HEADER)?;
    for watch in watches {
        for reading in &watch.readings {
            let mut row = vec![
                watch.uid.clone(),
                reading.sensor.clone(),
                format_date(reading),
            ];
            row.extend(reading.values.iter().copied().map(format_value));
            writer.write_record(&row)?;
        }
    }
    writer.flush()?;
    Ok(())
}
