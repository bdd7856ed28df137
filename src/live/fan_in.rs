use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::registry::WatchRegistry;
use crate::session::Subscription;

use super::{CaptureSummary, LiveEvent};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Merge every subscribed stream into `sink` until `cancel_token` fires.
/// Streams that end (device gone, session replaced) simply drop out.
pub async fn capture_loop(
    mut streams: StreamMap<String, Subscription>,
    registry: Arc<WatchRegistry>,
    store: bool,
    sink: mpsc::Sender<LiveEvent>,
    cancel_token: CancellationToken,
) -> CaptureSummary {
    let mut summary = CaptureSummary::default();
    let mut sink_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = streams.next(), if !streams.is_empty() => {
                let Some((watch_uid, reading)) = next else {
                    log_debug!("every live stream has ended");
                    continue;
                };

                if sink_open {
                    let event = LiveEvent {
                        watch_uid: watch_uid.clone(),
                        reading: reading.clone(),
                    };
                    tokio::select! {
                        sent = sink.send(event) => {
                            if sent.is_ok() {
                                summary.delivered += 1;
                            } else {
                                log_warn!("live sink closed; readings are no longer emitted");
                                sink_open = false;
                            }
                        }
                        _ = cancel_token.cancelled() => {}
                    }
                }

                if store {
                    match registry.record_reading(&watch_uid, reading).await {
                        Ok(()) => summary.stored += 1,
                        Err(err) => {
                            summary.store_failures += 1;
                            log_warn!("failed to store live reading from {watch_uid}: {err}");
                        }
                    }
                }
            }
        }
    }

    log_info!(
        "live capture finished: {} delivered, {} stored, {} store failures",
        summary.delivered,
        summary.stored,
        summary.store_failures
    );
    summary
}
