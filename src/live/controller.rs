use std::{collections::HashSet, sync::Arc};

use log::info;
use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;

use crate::db::Reading;
use crate::error::{CaptureError, SessionError};
use crate::registry::WatchRegistry;
use crate::session::{DeviceSession, SubscriptionHandle};
use crate::transport::ParamValue;

use super::{fan_in::capture_loop, CaptureClaims, CaptureStatus, CaptureSummary, ClaimGuard};

/// Remote parameter holding the push interval in milliseconds.
pub const LIVE_INTERVAL_PARAM: &str = "live.interval";

/// One reading emitted by a running capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    pub watch_uid: String,
    pub reading: Reading,
}

/// Outcome of activation. Devices that refused the interval are listed in
/// `failed` and excluded from the capture.
#[derive(Debug, Default)]
pub struct ActivationReport {
    pub active: Vec<String>,
    pub failed: Vec<(String, SessionError)>,
}

/// Streams readings from a set of connected watches into one sink.
///
/// `start` validates every watch before touching any of them, so a capture
/// either covers the whole selection or does nothing at all.
pub struct LiveCapture {
    registry: Arc<WatchRegistry>,
    claims: CaptureClaims,
    status: CaptureStatus,
    handle: Option<JoinHandle<CaptureSummary>>,
    cancel_token: Option<CancellationToken>,
    subscriptions: Vec<SubscriptionHandle>,
    claim: Option<ClaimGuard>,
}

impl LiveCapture {
    pub fn new(registry: Arc<WatchRegistry>, claims: CaptureClaims) -> Self {
        Self {
            registry,
            claims,
            status: CaptureStatus::Idle,
            handle: None,
            cancel_token: None,
            subscriptions: Vec::new(),
            claim: None,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub async fn start(
        &mut self,
        uids: &[String],
        interval_ms: i64,
        store: bool,
        sink: mpsc::Sender<LiveEvent>,
    ) -> Result<ActivationReport, CaptureError> {
        if self.status != CaptureStatus::Idle {
            return Err(CaptureError::AlreadyStarted);
        }
        if interval_ms <= 0 {
            return Err(CaptureError::InvalidInterval(interval_ms));
        }

        let mut seen = HashSet::new();
        let uids: Vec<String> = uids
            .iter()
            .filter(|uid| seen.insert(uid.as_str()))
            .cloned()
            .collect();
        if uids.is_empty() {
            return Err(CaptureError::NoWatches);
        }

        let mut targets = Vec::with_capacity(uids.len());
        for uid in &uids {
            let view = self
                .registry
                .find_by_uid(uid)
                .await
                .ok_or_else(|| CaptureError::UnknownWatch(uid.clone()))?;
            match view.session {
                Some(session) if !session.is_closed() => targets.push((uid.clone(), session)),
                _ => return Err(CaptureError::NotConnected(uid.clone())),
            }
        }

        let mut claim = self
            .claims
            .claim(&uids)
            .map_err(CaptureError::AlreadyCapturing)?;

        let (accepted, failed) = configure_interval(targets, interval_ms).await;
        for (uid, _) in &failed {
            claim.release(uid);
        }

        let mut streams = StreamMap::new();
        let mut report = ActivationReport {
            failed,
            ..ActivationReport::default()
        };
        for (uid, session) in accepted {
            let subscription = session.subscribe();
            self.subscriptions.push(subscription.handle());
            streams.insert(uid.clone(), subscription);
            report.active.push(uid);
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            streams,
            self.registry.clone(),
            store,
            sink,
            cancel_token.clone(),
        ));

        info!(
            "live capture started on {:?} every {interval_ms} ms (store: {store})",
            report.active
        );
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.claim = Some(claim);
        self.status = CaptureStatus::Running;
        Ok(report)
    }

    /// Stop emitting, end every subscription and release the watches.
    /// Readings already taken off a stream finish persisting first.
    pub async fn stop(&mut self) -> CaptureSummary {
        if self.status != CaptureStatus::Running {
            return CaptureSummary::default();
        }
        self.status = CaptureStatus::Stopped;

        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }

        let summary = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(summary) => summary,
                Err(err) => {
                    log::error!("live capture task failed to join: {err}");
                    CaptureSummary::default()
                }
            },
            None => CaptureSummary::default(),
        };

        self.claim = None;
        summary
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

type Accepted = Vec<(String, DeviceSession)>;
type Refused = Vec<(String, SessionError)>;

/// Push the interval to every device concurrently. Results keep the order
/// of `targets`.
async fn configure_interval(
    targets: Vec<(String, DeviceSession)>,
    interval_ms: i64,
) -> (Accepted, Refused) {
    let mut tasks = JoinSet::new();
    for (index, (uid, session)) in targets.into_iter().enumerate() {
        tasks.spawn(async move {
            let result = session
                .set_value(LIVE_INTERVAL_PARAM, ParamValue::Long(interval_ms))
                .await;
            (index, uid, session, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => log::error!("interval task failed to join: {err}"),
        }
    }
    results.sort_by_key(|(index, ..)| *index);

    let mut accepted = Vec::new();
    let mut refused = Vec::new();
    for (_, uid, session, result) in results {
        match result {
            Ok(()) => accepted.push((uid, session)),
            Err(err) => {
                log::warn!("watch {uid} refused the live interval: {err}");
                refused.push((uid, err));
            }
        }
    }
    (accepted, refused)
}
