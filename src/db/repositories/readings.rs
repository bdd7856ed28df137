use anyhow::{anyhow, Context, Result};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{parse_millis, to_i64, to_usize},
    models::Reading,
};

/// `datapoint_entry.type` is reserved; every element is written as a plain value.
const ENTRY_TYPE_VALUE: i64 = 0;

impl Database {
    /// Store one reading as a `datapoint` row plus one `datapoint_entry` row
    /// per vector element, all in a single transaction.
    pub async fn append_reading(&self, watch_uid: &str, reading: &Reading) -> Result<i64> {
        let watch_uid = watch_uid.to_string();
        let record = reading.clone();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open datapoint transaction")?;

            tx.execute(
                "INSERT INTO datapoint (watch_id, date, amount, sensor) VALUES (?1, ?2, ?3, ?4)",
                params![
                    watch_uid,
                    record.timestamp_millis(),
                    to_i64(record.values.len(), "amount")?,
                    record.sensor,
                ],
            )
            .with_context(|| format!("failed to insert datapoint for watch {watch_uid}"))?;
            let datapoint_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO datapoint_entry (datapoint_id, i, type, value) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (index, value) in record.values.iter().enumerate() {
                    stmt.execute(params![
                        datapoint_id,
                        to_i64(index, "i")?,
                        ENTRY_TYPE_VALUE,
                        value
                    ])
                    .with_context(|| format!("failed to insert entry {index} of datapoint {datapoint_id}"))?;
                }
            }

            tx.commit().context("failed to commit datapoint")?;
            Ok(datapoint_id)
        })
        .await
    }

    /// Every stored reading of a watch, ascending by timestamp. Readings with
    /// the same timestamp come back in insertion order.
    pub async fn load_readings(&self, watch_uid: &str) -> Result<Vec<Reading>> {
        let watch_uid = watch_uid.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT d.id, d.sensor, d.date, d.amount, e.i, e.value
                 FROM datapoint d
                 LEFT JOIN datapoint_entry e ON e.datapoint_id = d.id
                 WHERE d.watch_id = ?1
                 ORDER BY d.date ASC, d.id ASC, e.i ASC",
            )?;

            let mut rows = stmt.query(params![watch_uid])?;
            let mut readings = Vec::new();
            let mut current: Option<PartialReading> = None;

            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                if current.as_ref().map(|partial| partial.id) != Some(id) {
                    if let Some(done) = current.take() {
                        readings.push(done.finish()?);
                    }
                    let amount = to_usize(row.get::<_, i64>(3)?, "amount")?;
                    current = Some(PartialReading {
                        id,
                        sensor: row.get(1)?,
                        date: row.get(2)?,
                        values: vec![None; amount],
                    });
                }

                let index: Option<i64> = row.get(4)?;
                let value: Option<f64> = row.get(5)?;
                if let (Some(partial), Some(index), Some(value)) = (current.as_mut(), index, value) {
                    let index = to_usize(index, "i")?;
                    let slot = partial.values.get_mut(index).ok_or_else(|| {
                        anyhow!("datapoint {} has entry {index} beyond its amount", partial.id)
                    })?;
                    *slot = Some(value);
                }
            }

            if let Some(done) = current.take() {
                readings.push(done.finish()?);
            }

            Ok(readings)
        })
        .await
    }

    pub async fn count_readings(&self, watch_uid: &str) -> Result<usize> {
        let watch_uid = watch_uid.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM datapoint WHERE watch_id = ?1",
                params![watch_uid],
                |row| row.get(0),
            )?;
            to_usize(count, "count")
        })
        .await
    }
}

struct PartialReading {
    id: i64,
    sensor: String,
    date: i64,
    values: Vec<Option<f64>>,
}

impl PartialReading {
    fn finish(self) -> Result<Reading> {
        let id = self.id;
        let values = self
            .values
            .into_iter()
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| anyhow!("datapoint {id} is missing entries"))?;
        Reading::new(self.sensor, parse_millis(self.date, "date")?, values)
            .with_context(|| format!("datapoint {id} is malformed"))
    }
}
