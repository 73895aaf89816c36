// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Receiving side of subtask events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, instrument, warn};
use wizard_protocol::frame::read_frame;
use wizard_protocol::transport::listen;

use super::SubtaskEvent;
use crate::error::Result;

/// Time a bottle sender gets to deliver its frame.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Loopback listener turning bottles into [`SubtaskEvent`]s.
///
/// Bottles are read one connection at a time, in accept order, so the
/// events of one runner come out in the order they were sent.
pub struct BottleListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<SubtaskEvent>,
}

impl BottleListener {
    /// Bind loopback `port` (0 for any).
    pub async fn bind(port: u16) -> Result<(Self, mpsc::UnboundedReceiver<SubtaskEvent>)> {
        let (listener, local_addr) = listen(SocketAddr::from(([127, 0, 0, 1], port))).await?;
        let (events, rx) = mpsc::unbounded_channel();
        info!(port = local_addr.port(), "Subtask listener bound");
        Ok((
            Self {
                listener,
                local_addr,
                events,
            },
            rx,
        ))
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive until `shutdown` is notified or the receiver is dropped.
    #[instrument(skip_all, fields(port = self.port()))]
    pub async fn run(self, shutdown: Arc<Notify>) {
        loop {
            let mut stream = tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept bottle");
                        continue;
                    }
                },
            };
            let frame = match tokio::time::timeout(READ_TIMEOUT, read_frame(&mut stream)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    debug!(error = %e, "Empty or broken bottle");
                    continue;
                }
                Err(_) => {
                    debug!("Bottle sender stalled");
                    continue;
                }
            };
            match frame.decode::<SubtaskEvent>() {
                Ok(event) => {
                    if self.events.send(event).is_err() {
                        debug!("Event receiver dropped");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed subtask event"),
            }
        }
        info!("Subtask listener stopped");
    }
}
