// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server helpers shared by the proxy, bridge, launcher, team and
//! subtask listener.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::frame::{FrameError, FramedStream};
use crate::transport::{TransportError, listen, probe_free_port};

/// Default number of probed ports [`FramedServer::bind_probing`] tries.
pub const BIND_RETRIES: usize = 8;

/// Errors that can occur in a framed server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("server closed")]
    Closed,
}

/// Configuration for a framed server
#[derive(Debug, Clone)]
pub struct FramedServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Accept only peers whose IP is loopback
    pub loopback_only: bool,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl FramedServerConfig {
    /// Loopback server on `port`.
    pub fn loopback(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            loopback_only: true,
            max_concurrent_handlers: 0,
        }
    }

    /// Server reachable from other hosts.
    pub fn public(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            loopback_only: false,
            max_concurrent_handlers: 0,
        }
    }

    /// Limit the number of connections served at once.
    pub fn with_max_concurrent_handlers(mut self, max: u32) -> Self {
        self.max_concurrent_handlers = max;
        self
    }
}

/// A bound TCP server speaking length-prefixed JSON.
pub struct FramedServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: FramedServerConfig,
}

impl FramedServer {
    /// Bind the server socket.
    pub async fn bind(config: FramedServerConfig) -> Result<Self, ServerError> {
        let (listener, local_addr) = listen(config.bind_addr).await?;
        info!(
            addr = %local_addr,
            loopback_only = config.loopback_only,
            max_handlers = config.max_concurrent_handlers,
            "Framed server bound"
        );
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Bind the first free loopback port from `start`, skipping `reserved`.
    ///
    /// A probed port can be taken before the bind; the search then resumes
    /// after it, at most `retries` times.
    pub async fn bind_probing(
        start: u16,
        reserved: &[u16],
        retries: usize,
    ) -> Result<Self, ServerError> {
        let mut from = start;
        let mut last_error = None;
        for _ in 0..retries {
            let Some(port) = probe_free_port("127.0.0.1", from, reserved) else {
                break;
            };
            match Self::bind(FramedServerConfig::loopback(port)).await {
                Ok(server) => return Ok(server),
                Err(e) => {
                    debug!(port, error = %e, "Lost probed port, trying the next one");
                    last_error = Some(e);
                    from = port.saturating_add(1);
                }
            }
        }
        Err(last_error.unwrap_or(ServerError::Closed))
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the server configuration
    pub fn config(&self) -> &FramedServerConfig {
        &self.config
    }

    /// Run the accept loop until `shutdown` is notified.
    ///
    /// Each accepted connection is handed to `handler` on its own task.
    /// Handlers own the connection: they decide how many frames to read and
    /// when to close.
    #[instrument(skip(self, handler, shutdown), fields(addr = %self.local_addr))]
    pub async fn run<H, Fut>(self, handler: H, shutdown: Arc<Notify>) -> Result<(), ServerError>
    where
        H: Fn(FramedStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = if self.config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_handlers as usize,
            )))
        } else {
            None
        };

        loop {
            let (stream, remote_addr) = tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!("Framed server received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if self.config.loopback_only && !remote_addr.ip().is_loopback() {
                warn!(%remote_addr, "Rejecting non-loopback peer");
                continue;
            }

            debug!(%remote_addr, "Accepted connection");
            let _ = stream.set_nodelay(true);
            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = if let Some(ref sem) = semaphore {
                    match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    }
                } else {
                    None
                };

                handler(FramedStream::new(stream), remote_addr).await;
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Endpoint, SIGNAL_TIMEOUT, send_signal};
    use serde_json::json;

    #[test]
    fn test_loopback_config() {
        let config = FramedServerConfig::loopback(11111);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:11111");
        assert!(config.loopback_only);
        assert_eq!(config.max_concurrent_handlers, 0);
    }

    #[tokio::test]
    async fn test_run_echoes_and_stops_on_shutdown() {
        let server = FramedServer::bind(FramedServerConfig::loopback(0))
            .await
            .unwrap();
        let endpoint = Endpoint::from(server.local_addr());
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(server.run(
            |mut conn, _addr| async move {
                if let Ok(value) = conn.read_value().await {
                    let _ = conn.respond(&value).await;
                }
            },
            shutdown.clone(),
        ));

        let reply = send_signal(&endpoint, &json!({"ping": 1}), SIGNAL_TIMEOUT).await;
        assert_eq!(reply, Some(json!({"ping": 1})));

        shutdown.notify_one();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_skips_taken_and_reserved_ports() {
        let start = probe_free_port("127.0.0.1", 42000, &[]).unwrap();
        let _taken = std::net::TcpListener::bind(("127.0.0.1", start)).unwrap();
        let reserved = [start + 1];

        let server = FramedServer::bind_probing(start, &reserved, BIND_RETRIES)
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert!(port > start + 1);
        assert!(server.config().loopback_only);
    }

    #[tokio::test]
    async fn test_bind_without_retries_fails() {
        let result = FramedServer::bind_probing(42000, &[], 0).await;
        assert!(matches!(result, Err(ServerError::Closed)));
    }
}
