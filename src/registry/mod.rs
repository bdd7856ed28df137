//! Identity-keyed registry of known watches.
//!
//! Every watch lives in its own slot guarded by an async mutex, so calls for
//! one uid are serialized while calls for different uids never wait on each
//! other. Slots are created atomically through the `DashMap` entry API, which
//! makes reconnect-or-create a single upsert instead of a check-then-act.

mod watch;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};

use anyhow::Result;
use dashmap::DashMap;
use log::{error, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{Database, Reading};
use crate::error::RegistryError;
use crate::session::DeviceSession;

pub use watch::{WatchSnapshot, WatchView};
use watch::Watch;

type Slot = Arc<Mutex<Option<Watch>>>;

/// What `attach` did with a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Created { name: String },
    Reconnected { replaced: Option<Uuid> },
    /// The session had already closed; nothing was changed.
    Rejected,
}

pub struct WatchRegistry {
    db: Database,
    slots: DashMap<String, Slot>,
    order: StdMutex<Vec<String>>,
    placeholder_counter: AtomicUsize,
}

impl WatchRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            slots: DashMap::new(),
            order: StdMutex::new(Vec::new()),
            placeholder_counter: AtomicUsize::new(0),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Bootstrap from the store. Histories stay unloaded until first needed
    /// and no watch has a session yet.
    pub async fn load_all(&self) -> Result<Vec<WatchView>> {
        let records = self.db.load_all_watches().await?;
        let mut views = Vec::with_capacity(records.len());

        for record in records {
            let watch = Watch::stored(record.uid.clone(), record.name);
            views.push(watch.view());
            self.slots
                .insert(record.uid.clone(), Arc::new(Mutex::new(Some(watch))));
            self.order_mut().push(record.uid);
        }

        self.placeholder_counter
            .fetch_max(views.len(), Ordering::SeqCst);
        info!("loaded {} watches from database", views.len());
        Ok(views)
    }

    pub fn len(&self) -> usize {
        self.order_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn find_by_uid(&self, uid: &str) -> Option<WatchView> {
        let slot = self.existing_slot(uid)?;
        let guard = slot.lock().await;
        guard.as_ref().map(Watch::view)
    }

    /// Attach `session` to the watch with `uid`, creating and persisting the
    /// watch on first contact. A session already attached to that watch is
    /// closed, which ends its subscriptions. A session that closed before
    /// reaching this point is rejected and leaves the watch untouched.
    pub async fn attach(
        &self,
        uid: &str,
        session: DeviceSession,
    ) -> Result<AttachOutcome, RegistryError> {
        let slot = self
            .slots
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone();
        let mut guard = slot.lock().await;

        if session.is_closed() {
            info!("watch {uid}: session {} closed before attach", session.id());
            return Ok(AttachOutcome::Rejected);
        }

        if let Some(watch) = guard.as_mut() {
            let replaced = watch.session.replace(session.clone());
            let replaced_id = match replaced {
                Some(previous) if previous.id() != session.id() => {
                    info!(
                        "watch {uid}: session {} replaces {}",
                        session.id(),
                        previous.id()
                    );
                    previous.close();
                    Some(previous.id())
                }
                _ => None,
            };
            return Ok(AttachOutcome::Reconnected {
                replaced: replaced_id,
            });
        }

        let number = self.placeholder_counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("Watch {number}");
        if let Err(source) = self.db.insert_watch(uid, &name).await {
            error!("failed to store new watch {uid}: {source}");
            return Err(RegistryError::Persistence {
                uid: uid.to_string(),
                source,
            });
        }

        *guard = Some(Watch::connected(uid.to_string(), name.clone(), session));
        self.order_mut().push(uid.to_string());
        info!("registered new watch {uid} as '{name}'");

        Ok(AttachOutcome::Created { name })
    }

    /// Clear the session slot if `session_id` is still the attached session.
    pub async fn detach_if(&self, uid: &str, session_id: Uuid) -> bool {
        let Some(slot) = self.existing_slot(uid) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(watch) if watch.session.as_ref().map(DeviceSession::id) == Some(session_id) => {
                watch.session = None;
                info!("watch {uid} disconnected");
                true
            }
            _ => false,
        }
    }

    /// Append to the in-memory history and write through to the store. If
    /// the store write fails the append is undone.
    pub async fn record_reading(&self, uid: &str, reading: Reading) -> Result<(), RegistryError> {
        let slot = self
            .existing_slot(uid)
            .ok_or_else(|| RegistryError::UnknownWatch(uid.to_string()))?;
        let mut guard = slot.lock().await;
        let watch = guard
            .as_mut()
            .ok_or_else(|| RegistryError::UnknownWatch(uid.to_string()))?;

        if reading.values.is_empty() {
            return Err(RegistryError::InvalidReading {
                uid: uid.to_string(),
                reason: "no values".into(),
            });
        }

        watch.readings.push(reading.clone());
        if let Err(err) = self.db.append_reading(uid, &reading).await {
            watch.readings.pop();
            return Err(RegistryError::Persistence {
                uid: uid.to_string(),
                source: err.into(),
            });
        }
        Ok(())
    }

    pub async fn rename(&self, uid: &str, name: &str) -> Result<(), RegistryError> {
        let slot = self
            .existing_slot(uid)
            .ok_or_else(|| RegistryError::UnknownWatch(uid.to_string()))?;
        let mut guard = slot.lock().await;
        let watch = guard
            .as_mut()
            .ok_or_else(|| RegistryError::UnknownWatch(uid.to_string()))?;

        self.db
            .rename_watch(uid, name)
            .await
            .map_err(|err| RegistryError::Persistence {
                uid: uid.to_string(),
                source: err.into(),
            })?;
        watch.name = name.to_string();
        Ok(())
    }

    /// Every watch in registry order. `reading_count` is the full stored
    /// count; histories that are not loaded yet are counted in the store.
    pub async fn list(&self) -> Result<Vec<WatchView>, RegistryError> {
        let mut views = Vec::new();
        for uid in self.ordered_uids() {
            if let Some(slot) = self.existing_slot(&uid) {
                let guard = slot.lock().await;
                if let Some(watch) = guard.as_ref() {
                    let mut view = watch.view();
                    if !watch.history_loaded {
                        view.reading_count = self.db.count_readings(&uid).await.map_err(|err| {
                            RegistryError::Persistence {
                                uid: uid.clone(),
                                source: err.into(),
                            }
                        })?;
                    }
                    views.push(view);
                }
            }
        }
        Ok(views)
    }

    /// Histories of the selected watches (all when `uids` is empty), sorted
    /// by time, in registry order for "all" and in the given order otherwise.
    pub async fn snapshots(&self, uids: &[String]) -> Result<Vec<WatchSnapshot>, RegistryError> {
        let selection = if uids.is_empty() {
            self.ordered_uids()
        } else {
            uids.to_vec()
        };

        let mut snapshots = Vec::with_capacity(selection.len());
        for uid in selection {
            let slot = self
                .existing_slot(&uid)
                .ok_or_else(|| RegistryError::UnknownWatch(uid.clone()))?;
            let mut guard = slot.lock().await;
            let watch = guard
                .as_mut()
                .ok_or_else(|| RegistryError::UnknownWatch(uid.clone()))?;
            self.hydrate(watch).await?;
            snapshots.push(watch.snapshot());
        }
        Ok(snapshots)
    }

    async fn hydrate(&self, watch: &mut Watch) -> Result<(), RegistryError> {
        if watch.history_loaded {
            return Ok(());
        }
        // Every accepted reading was written through, so the store holds a
        // superset of what is in memory.
        let readings = self
            .db
            .load_readings(&watch.uid)
            .await
            .map_err(|err| RegistryError::Persistence {
                uid: watch.uid.clone(),
                source: err.into(),
            })?;
        watch.readings = readings;
        watch.history_loaded = true;
        Ok(())
    }

    fn existing_slot(&self, uid: &str) -> Option<Slot> {
        self.slots.get(uid).map(|entry| entry.value().clone())
    }

    fn ordered_uids(&self) -> Vec<String> {
        self.order_mut().clone()
    }

    fn order_mut(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
