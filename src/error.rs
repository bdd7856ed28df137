use thiserror::Error;

/// Failure of a request/response exchange with a device.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("session closed before a response arrived")]
    Closed,
    #[error("device rejected '{param}': {message}")]
    Remote { param: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watch '{0}' is already stored")]
    DuplicateIdentity(String),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown watch '{0}'")]
    UnknownWatch(String),
    #[error("failed to persist watch '{uid}'")]
    Persistence {
        uid: String,
        #[source]
        source: StoreError,
    },
    #[error("invalid reading for watch '{uid}': {reason}")]
    InvalidReading { uid: String, reason: String },
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity query failed: {0}")]
    Session(#[from] SessionError),
    #[error("identity value is missing or malformed")]
    Malformed,
    #[error("watch '{0}' could not be registered")]
    Registration(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("watch with id {0} not known")]
    UnknownWatch(String),
    #[error("watch with id {0} not connected")]
    NotConnected(String),
    #[error("watch with id {0} is already in a live capture")]
    AlreadyCapturing(String),
    #[error("interval must be positive, got {0}")]
    InvalidInterval(i64),
    #[error("no watches given")]
    NoWatches,
    #[error("capture was already started")]
    AlreadyStarted,
}
