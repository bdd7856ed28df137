use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};

use super::DeviceSession;
use crate::db::Reading;

/// Identifies one subscriber on one session.
#[derive(Clone)]
pub struct SubscriptionHandle {
    session: DeviceSession,
    id: u64,
}

impl SubscriptionHandle {
    pub(super) fn new(session: DeviceSession, id: u64) -> Self {
        Self { session, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn unsubscribe(&self) -> bool {
        self.session.unsubscribe(self.id)
    }
}

/// Stream of readings pushed by one session. Ends when the subscriber is
/// removed or the session closes.
pub struct Subscription {
    handle: SubscriptionHandle,
    readings: ReceiverStream<Reading>,
}

impl Subscription {
    pub(super) fn new(handle: SubscriptionHandle, rx: mpsc::Receiver<Reading>) -> Self {
        Self {
            handle,
            readings: ReceiverStream::new(rx),
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub async fn recv(&mut self) -> Option<Reading> {
        self.readings.next().await
    }
}

impl Stream for Subscription {
    type Item = Reading;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Reading>> {
        Pin::new(&mut self.readings).poll_next(cx)
    }
}
