//! Turns freshly accepted connections into registered watches.
//!
//! A connection is only attached once the watch has answered the identity
//! query; which watch it is never depends on connection order or address.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{IdentityError, RegistryError, SessionError};
use crate::registry::{AttachOutcome, WatchRegistry};
use crate::session::DeviceSession;
use crate::transport::TransportLink;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub const DEFAULT_IDENTITY_PARAM: &str = "system.uid";

pub struct IdentityResolver {
    registry: Arc<WatchRegistry>,
    identity_param: String,
    subscriber_buffer: usize,
    fatal: mpsc::Sender<RegistryError>,
}

impl IdentityResolver {
    /// `fatal` receives registration failures that must end the process.
    pub fn new(
        registry: Arc<WatchRegistry>,
        identity_param: impl Into<String>,
        subscriber_buffer: usize,
        fatal: mpsc::Sender<RegistryError>,
    ) -> Self {
        Self {
            registry,
            identity_param: identity_param.into(),
            subscriber_buffer,
            fatal,
        }
    }

    /// Ask the watch behind `session` for its uid.
    pub async fn resolve(&self, session: &DeviceSession) -> Result<String, IdentityError> {
        let values = session.request(&self.identity_param).await?;
        values
            .first()
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .map(str::to_string)
            .ok_or(IdentityError::Malformed)
    }

    /// Wrap `link` in a session, identify it and attach it. Sessions that
    /// cannot be identified are closed and never registered.
    pub async fn handle_link(&self, link: TransportLink) -> Result<String, IdentityError> {
        log_info!("got a new watch connection from {}", link.peer);
        let session = DeviceSession::spawn(link, self.subscriber_buffer);

        let uid = match self.resolve(&session).await {
            Ok(uid) => uid,
            Err(err) => {
                log_warn!("session {}: identity query failed: {err}", session.id());
                session.close();
                return Err(err);
            }
        };
        log_info!("session {} belongs to watch {uid}", session.id());

        match self.registry.attach(&uid, session.clone()).await {
            Ok(AttachOutcome::Rejected) => {
                log_warn!("session {}: closed before watch {uid} was attached", session.id());
                return Err(IdentityError::Session(SessionError::Closed));
            }
            Ok(_) => {}
            Err(err) => {
                log_error!("failed to register watch {uid}: {err}");
                session.close();
                let _ = self.fatal.send(err).await;
                return Err(IdentityError::Registration(uid));
            }
        }

        let registry = self.registry.clone();
        let session_uid = uid.clone();
        tokio::spawn(async move {
            session.closed().await;
            registry.detach_if(&session_uid, session.id()).await;
        });

        Ok(uid)
    }

    /// Handle every link that arrives until `shutdown` fires or the
    /// acceptor goes away. Each connection is identified concurrently.
    pub async fn run(
        self: Arc<Self>,
        mut links: mpsc::Receiver<TransportLink>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                link = links.recv() => match link {
                    Some(link) => {
                        let resolver = self.clone();
                        tokio::spawn(async move {
                            let _ = resolver.handle_link(link).await;
                        });
                    }
                    None => break,
                },
            }
        }
        log_info!("identity resolver stopped");
    }
}
