use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

/// How long a statement waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the worker thread. Dropping the last `Database` clone closes the
/// task channel, which ends the worker loop, and then joins the thread.
struct Worker {
    tasks: Option<mpsc::Sender<DbTask>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.tasks.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("database worker panicked");
            }
        }
    }
}

/// Handle to the SQLite store. All statements run on one dedicated worker
/// thread; clones share that thread.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    db_path: Arc<PathBuf>,
}

/// Open `path` ready for the watch store: foreign keys enforced (the
/// `datapoint` tables reference `smartwatch`), a busy timeout, WAL when the
/// filesystem allows it, and the schema migrated to the current version.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    conn.pragma_update(None, "foreign_keys", true)
        .context("failed to enable foreign keys")?;
    let enforced: bool = conn
        .pragma_query_value(None, "foreign_keys", |row| row.get(0))
        .context("failed to read foreign_keys pragma")?;
    if !enforced {
        bail!("SQLite refused to enforce foreign keys; readings could outlive their watch");
    }

    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
        Ok(mode) => warn!("WAL unavailable, journal mode stays '{mode}'"),
        Err(err) => warn!("failed to enable WAL: {err}"),
    }

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

impl Database {
    /// Open the store on its worker thread. Returns only once the connection
    /// is configured and migrated, or with the reason it could not be.
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (task_tx, task_rx) = mpsc::channel::<DbTask>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path = db_path.clone();

        let thread = thread::Builder::new()
            .name("watchlink-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                for task in task_rx {
                    task(&mut conn);
                }
                info!("database worker stopped");
            })
            .context("failed to spawn database worker thread")?;

        let ready = ready_rx
            .recv()
            .context("database worker exited before signaling readiness");
        let worker = Arc::new(Worker {
            tasks: Some(task_tx),
            thread: Some(thread),
        });
        // On failure the worker has already returned; dropping it joins.
        ready??;

        info!("watch store ready at {}", db_path.display());
        Ok(Self {
            worker,
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Run `task` on the worker thread and await its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tasks = self
            .worker
            .tasks
            .as_ref()
            .ok_or_else(|| anyhow!("database worker is shut down"))?;
        let (reply_tx, reply_rx) = oneshot::channel();

        tasks
            .send(Box::new(move |conn| {
                // The caller may have stopped waiting; the work is done either way.
                let _ = reply_tx.send(task(conn));
            }))
            .map_err(|_| anyhow!("database worker is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database worker dropped the task"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::CURRENT_SCHEMA_VERSION;

    #[tokio::test]
    async fn creates_parent_directory_and_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("database.db");
        let db = Database::new(path.clone()).unwrap();
        assert_eq!(db.path(), path.as_path());

        let version: i32 = db
            .execute(|conn| {
                Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn connection_enforces_references_and_waits_on_locks() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("database.db")).unwrap();

        let (busy_ms, journal): (i64, String) = db
            .execute(|conn| {
                let busy = conn.pragma_query_value(None, "busy_timeout", |row| row.get(0))?;
                let journal = conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
                Ok((busy, journal))
            })
            .await
            .unwrap();
        assert_eq!(busy_ms, 5_000);
        assert_eq!(journal, "wal");

        let orphan = db
            .execute(|conn| {
                conn.execute(
                    "INSERT INTO datapoint (watch_id, date, amount, sensor) VALUES ('ghost', 1, 1, 'hr')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn task_errors_are_returned_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("database.db")).unwrap();

        let result: Result<()> = db
            .execute(|conn| {
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        // The worker survives a failed task.
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM smartwatch", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn unreadable_store_fails_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.db");
        // Not a SQLite file: the migration step cannot read its version.
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        assert!(Database::new(path).is_err());
    }
}
