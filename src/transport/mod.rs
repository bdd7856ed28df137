//! Messages exchanged with a watch and the channel pair a session drives.
//!
//! The session layer only sees `TransportLink`s; how bytes reach the device
//! is up to the adapter (`tcp` for real watches, `duplex` for in-process use).

pub mod tcp;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use tcp::TcpAcceptor;

const LINK_CAPACITY: usize = 64;

/// A parameter value carried by get/set requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl ParamValue {
    /// Interpret operator input: integers, then floats, then booleans, else text.
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(value) = raw.parse::<i64>() {
            return ParamValue::Long(value);
        }
        if let Ok(value) = raw.parse::<f64>() {
            return ParamValue::Double(value);
        }
        match raw {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::String(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(value) => write!(f, "{value:?}"),
            ParamValue::Long(value) => write!(f, "{value}"),
            ParamValue::Double(value) => write!(f, "{value:?}"),
            ParamValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// Sent to the watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Get { id: u64, param: String },
    Set { id: u64, param: String, value: ParamValue },
}

impl Outbound {
    pub fn id(&self) -> u64 {
        match self {
            Outbound::Get { id, .. } | Outbound::Set { id, .. } => *id,
        }
    }
}

/// Received from the watch: a reply to a request, or a pushed reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inbound {
    Response { id: u64, values: Vec<ParamValue> },
    Error { id: u64, message: String },
    Increment { sensor: String, timestamp: i64, values: Vec<f64> },
}

/// One connection as seen by a session. Dropping `outbound` and `inbound`
/// releases the underlying connection.
pub struct TransportLink {
    pub peer: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// The watch side of an in-process link.
pub struct DeviceEndpoint {
    pub requests: mpsc::Receiver<Outbound>,
    pub replies: mpsc::Sender<Inbound>,
}

/// In-process link pair. Closing `replies` looks like the watch hanging up.
pub fn duplex(peer: impl Into<String>) -> (TransportLink, DeviceEndpoint) {
    let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(LINK_CAPACITY);
    (
        TransportLink {
            peer: peer.into(),
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        DeviceEndpoint {
            requests: outbound_rx,
            replies: inbound_tx,
        },
    )
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use tokio::{sync::mpsc, task::JoinHandle};

    use super::{DeviceEndpoint, Inbound, Outbound, ParamValue};

    /// Scripted watch: answers the identity query, acknowledges or rejects
    /// sets, and pushes whatever the test asks it to.
    pub(crate) struct FakeWatch {
        replies: mpsc::Sender<Inbound>,
        task: JoinHandle<()>,
        seen: Arc<Mutex<Vec<Outbound>>>,
    }

    impl FakeWatch {
        pub(crate) fn spawn(endpoint: DeviceEndpoint, uid: Option<&str>, reject_sets: bool) -> Self {
            let DeviceEndpoint { mut requests, replies } = endpoint;
            let uid = uid.map(str::to_string);
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_in_task = seen.clone();
            let replies_in_task = replies.clone();

            let task = tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    seen_in_task.lock().unwrap().push(request.clone());
                    let reply = match request {
                        Outbound::Get { id, param } => match (&uid, param.as_str()) {
                            (Some(uid), "system.uid") => Inbound::Response {
                                id,
                                values: vec![ParamValue::String(uid.clone())],
                            },
                            _ => Inbound::Error {
                                id,
                                message: format!("unknown parameter {param}"),
                            },
                        },
                        Outbound::Set { id, .. } if reject_sets => Inbound::Error {
                            id,
                            message: "read-only".into(),
                        },
                        Outbound::Set { id, .. } => Inbound::Response { id, values: Vec::new() },
                    };
                    if replies_in_task.send(reply).await.is_err() {
                        break;
                    }
                }
            });

            Self { replies, task, seen }
        }

        pub(crate) async fn push(&self, sensor: &str, timestamp: i64, values: Vec<f64>) {
            self.replies
                .send(Inbound::Increment {
                    sensor: sensor.into(),
                    timestamp,
                    values,
                })
                .await
                .unwrap();
        }

        pub(crate) fn seen(&self) -> Vec<Outbound> {
            self.seen.lock().unwrap().clone()
        }

        /// Hang up: every sender of the session's inbound channel is dropped.
        pub(crate) async fn disconnect(self) {
            self.task.abort();
            let _ = self.task.await;
            drop(self.replies);
        }
    }
}
