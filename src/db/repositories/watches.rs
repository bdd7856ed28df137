use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{connection::Database, models::WatchRecord};
use crate::error::StoreError;

fn row_to_watch(row: &Row) -> Result<WatchRecord> {
    let name: Option<String> = row.get("name")?;
    Ok(WatchRecord {
        uid: row.get("id")?,
        name: name.unwrap_or_default(),
    })
}

impl Database {
    /// Insert a new watch. Fails with `DuplicateIdentity` when the uid is
    /// already stored.
    pub async fn insert_watch(&self, uid: &str, name: &str) -> Result<(), StoreError> {
        let uid = uid.to_string();
        let name = name.to_string();
        let uid_for_task = uid.clone();
        let inserted = self
            .execute(move |conn| {
                // Checked inside the same DB task so no other insert can interleave.
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM smartwatch WHERE id = ?1",
                        params![uid_for_task],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if exists {
                    return Ok(false);
                }

                conn.execute(
                    "INSERT INTO smartwatch (id, name) VALUES (?1, ?2)",
                    params![uid_for_task, name],
                )?;
                Ok(true)
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(StoreError::DuplicateIdentity(uid))
        }
    }

    pub async fn rename_watch(&self, uid: &str, name: &str) -> Result<bool> {
        let uid = uid.to_string();
        let name = name.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE smartwatch SET name = ?1 WHERE id = ?2",
                params![name, uid],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// All stored watches in insertion order.
    pub async fn load_all_watches(&self) -> Result<Vec<WatchRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM smartwatch ORDER BY rowid ASC")?;
            let mut rows = stmt.query([])?;
            let mut watches = Vec::new();
            while let Some(row) = rows.next()? {
                watches.push(row_to_watch(row)?);
            }
            Ok(watches)
        })
        .await
    }
}
