use serde::{Deserialize, Serialize};

/// A persisted `smartwatch` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRecord {
    pub uid: String,
    pub name: String,
}
