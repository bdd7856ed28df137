use crate::db::{models::reading::sort_by_time, Reading};
use crate::session::DeviceSession;

pub(super) struct Watch {
    pub(super) uid: String,
    pub(super) name: String,
    /// In arrival order. Complete only once `history_loaded` is set.
    pub(super) readings: Vec<Reading>,
    pub(super) history_loaded: bool,
    pub(super) session: Option<DeviceSession>,
}

impl Watch {
    pub(super) fn stored(uid: String, name: String) -> Self {
        Self {
            uid,
            name,
            readings: Vec::new(),
            history_loaded: false,
            session: None,
        }
    }

    /// First contact: nothing has been stored for this uid yet, so the empty
    /// history is already complete.
    pub(super) fn connected(uid: String, name: String, session: DeviceSession) -> Self {
        Self {
            uid,
            name,
            readings: Vec::new(),
            history_loaded: true,
            session: Some(session),
        }
    }

    pub(super) fn view(&self) -> WatchView {
        WatchView {
            uid: self.uid.clone(),
            name: self.name.clone(),
            session: self.session.clone(),
            reading_count: self.readings.len(),
        }
    }

    pub(super) fn snapshot(&self) -> WatchSnapshot {
        let mut readings = self.readings.clone();
        sort_by_time(&mut readings);
        WatchSnapshot {
            uid: self.uid.clone(),
            name: self.name.clone(),
            readings,
        }
    }
}

/// Read-only copy of a registry entry.
#[derive(Clone)]
pub struct WatchView {
    pub uid: String,
    pub name: String,
    pub session: Option<DeviceSession>,
    /// Readings currently held in memory; the full history once loaded.
    pub reading_count: usize,
}

impl WatchView {
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }
}

/// A watch's full history sorted by time, ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSnapshot {
    pub uid: String,
    pub name: String,
    pub readings: Vec<Reading>,
}
