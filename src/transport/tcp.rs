//! Plaintext TCP adapter. Each message is one line of JSON.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};

use super::{Inbound, Outbound, TransportLink, LINK_CAPACITY};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Longest line a watch may send. Anything longer ends the connection.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind watch listener")?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    /// Accept connections until `shutdown` fires or nobody takes new links.
    pub async fn run(self, links: mpsc::Sender<TransportLink>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log_info!("accepted watch connection from {peer}");
                        if links.send(open_link(stream, peer)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log_warn!("failed to accept watch connection: {err}"),
                },
            }
        }
        log_info!("watch listener stopped");
    }
}

/// Split the stream into a reader task (lines -> `Inbound`) and a writer task
/// (`Outbound` -> lines).
pub fn open_link(stream: TcpStream, peer: SocketAddr) -> TransportLink {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(LINK_CAPACITY);

    tokio::spawn(read_lines(read_half, inbound_tx, peer));
    tokio::spawn(write_lines(write_half, outbound_rx, peer));

    TransportLink {
        peer: peer.to_string(),
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

async fn read_lines(read_half: OwnedReadHalf, inbound: mpsc::Sender<Inbound>, peer: SocketAddr) {
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        let line = tokio::select! {
            _ = inbound.closed() => break,
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inbound>(line) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log_warn!("{peer}: ignoring malformed message: {err}"),
                }
            }
            None => {
                log_info!("{peer}: connection closed by watch");
                break;
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                log_warn!("{peer}: line longer than {MAX_LINE_LENGTH} bytes, dropping connection");
                break;
            }
            Some(Err(err)) => {
                log_warn!("{peer}: read failed: {err}");
                break;
            }
        }
    }
}

async fn write_lines(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    peer: SocketAddr,
) {
    while let Some(message) = outbound.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(err) => {
                log_warn!("{peer}: failed to encode request {}: {err}", message.id());
                continue;
            }
        };
        line.push('\n');
        if let Err(err) = write_half.write_all(line.as_bytes()).await {
            log_warn!("{peer}: write failed: {err}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
