use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::Database;
use crate::live::{CaptureClaims, LiveCapture};
use crate::registry::WatchRegistry;
use crate::LogBuffer;

/// Everything the long-lived tasks share, built once at startup.
pub struct AppContext {
    pub config: AppConfig,
    pub registry: Arc<WatchRegistry>,
    pub claims: CaptureClaims,
    pub shutdown: CancellationToken,
    /// Recent log lines for the console.
    pub logs: LogBuffer,
}

impl AppContext {
    /// Open the database and load every known watch.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let database = Database::new(config.database_path.clone())?;
        let registry = Arc::new(WatchRegistry::new(database));
        registry
            .load_all()
            .await
            .context("failed to load watches from the database")?;
        info!("using database {}", config.database_path.display());

        Ok(Self {
            config,
            registry,
            claims: CaptureClaims::new(),
            shutdown: CancellationToken::new(),
            logs: LogBuffer::default(),
        })
    }

    /// Share the buffer the installed logger writes into.
    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    pub fn database(&self) -> &Database {
        self.registry.database()
    }

    pub fn new_capture(&self) -> LiveCapture {
        LiveCapture::new(self.registry.clone(), self.claims.clone())
    }
}
