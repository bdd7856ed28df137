use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema steps in order; step `n` (1-based) upgrades a store to version `n`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("schema_v1.sql", include_str!("schemas/schema_v1.sql")),
    // Keeps a reading's sensor id across restarts.
    ("schema_v2.sql", include_str!("schemas/schema_v2.sql")),
];

pub(crate) const CURRENT_SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Bring the store up to `CURRENT_SCHEMA_VERSION` in one transaction. A
/// store written by a newer build is refused rather than downgraded.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    let applied = match usize::try_from(version) {
        Ok(applied) if applied <= MIGRATIONS.len() => applied,
        _ => bail!("unsupported watch store version {version} (this build knows {CURRENT_SCHEMA_VERSION})"),
    };
    let pending = &MIGRATIONS[applied..];
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (name, sql) in pending {
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply {name}"))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    log::info!("watch store migrated from version {version} to {CURRENT_SCHEMA_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn v1_database_gains_sensor_column() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("schemas/schema_v1.sql")).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute("INSERT INTO smartwatch (id, name) VALUES ('w', 'Watch 0')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO datapoint (watch_id, date, amount) VALUES ('w', 1, 1)",
            [],
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();

        let sensor: String = conn
            .query_row("SELECT sensor FROM datapoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sensor, "");
    }

    #[test]
    fn failed_step_leaves_the_version_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE datapoint (sensor TEXT)").unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        // schema_v2 adds a column that already exists.
        assert!(run_migrations(&mut conn).is_err());
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();
        assert!(run_migrations(&mut conn).is_err());
    }
}
