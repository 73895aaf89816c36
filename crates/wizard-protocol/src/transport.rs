// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP transport helpers shared by every link of the fabric.
//!
//! Failures at this layer are logged and turned into `None`/`false`; every
//! caller treats that as "peer unreachable" and applies its own retry policy.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::frame::{Frame, FramedStream, read_frame, write_frame};

/// Connect timeout for interactive calls.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout used when probing for a free port.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(20);

/// Upper bound for a request/reply exchange (some proxy queries are slow).
pub const SIGNAL_TIMEOUT: Duration = Duration::from_secs(200);

/// Connect timeout for fire-and-forget bottles.
pub const BOTTLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors raised while opening a listening socket.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A `host:port` pair.
///
/// Serializes as the JSON tuple `["host", port]`, the form used for
/// `wizard_team_dns` and the other published endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback endpoint on the given port.
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Parse `host:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host.trim_matches(|c| c == '[' || c == ']'), port))
    }
}

impl From<(String, u16)> for Endpoint {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Endpoint> for (String, u16) {
    fn from(endpoint: Endpoint) -> Self {
        (endpoint.host, endpoint.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Bind a listening socket and return it with its resolved address.
///
/// The socket is built with `SO_REUSEADDR` so a restarted server can take its
/// fixed port back while old connections sit in `TIME_WAIT`.
pub async fn listen(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), TransportError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind_err = |source: std::io::Error| TransportError::Bind {
        addr: addr.to_string(),
        source,
    };

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "Failed to set SO_REUSEADDR");
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;
    debug!(addr = %local_addr, "Listening");
    Ok((listener, local_addr))
}

/// Connect to `endpoint`, giving up after `connect_timeout`.
///
/// Never fails loudly: refusal and timeout are logged at debug level and
/// reported as `None`.
pub async fn get_connection(endpoint: &Endpoint, connect_timeout: Duration) -> Option<TcpStream> {
    let target = (endpoint.host.as_str(), endpoint.port);
    match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Some(stream)
        }
        Ok(Err(e)) => {
            debug!(endpoint = %endpoint, error = %e, "Connection refused");
            None
        }
        Err(_) => {
            debug!(
                endpoint = %endpoint,
                timeout_ms = connect_timeout.as_millis() as u64,
                "Connection timed out"
            );
            None
        }
    }
}

/// Connect, send one frame, read one reply frame, close.
///
/// Returns the decoded reply or `None` on any failure. A JSON `null` reply is
/// also returned as `None`, so callers cannot tell "peer down" from "peer
/// answered null": both mean the operation did not produce a value.
pub async fn send_signal(endpoint: &Endpoint, msg: &Value, reply_timeout: Duration) -> Option<Value> {
    send_signal_inner(endpoint, msg, reply_timeout, false).await
}

/// [`send_signal`] that logs failures at debug level only.
pub async fn send_signal_quiet(
    endpoint: &Endpoint,
    msg: &Value,
    reply_timeout: Duration,
) -> Option<Value> {
    send_signal_inner(endpoint, msg, reply_timeout, true).await
}

async fn send_signal_inner(
    endpoint: &Endpoint,
    msg: &Value,
    reply_timeout: Duration,
    quiet: bool,
) -> Option<Value> {
    let connect_timeout = reply_timeout.min(DEFAULT_CONNECT_TIMEOUT);
    let Some(stream) = get_connection(endpoint, connect_timeout).await else {
        if quiet {
            debug!(endpoint = %endpoint, "Peer unreachable");
        } else {
            error!(endpoint = %endpoint, "Peer unreachable");
        }
        return None;
    };

    let mut framed = FramedStream::new(stream);
    let exchange = async {
        framed.write_value(msg).await?;
        framed.read_value().await
    };

    match timeout(reply_timeout, exchange).await {
        Ok(Ok(Value::Null)) => None,
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            if quiet {
                debug!(endpoint = %endpoint, error = %e, "Signal exchange failed");
            } else {
                error!(endpoint = %endpoint, error = %e, "Signal exchange failed");
            }
            None
        }
        Err(_) => {
            warn!(
                endpoint = %endpoint,
                timeout_secs = reply_timeout.as_secs_f64(),
                "Signal reply timed out"
            );
            None
        }
    }
}

/// Fire-and-forget: connect with a very short timeout, send one frame, close.
pub async fn send_bottle(endpoint: &Endpoint, msg: &Value) -> bool {
    send_bottle_with_timeout(endpoint, msg, BOTTLE_TIMEOUT).await
}

/// [`send_bottle`] with a caller-chosen connect timeout.
pub async fn send_bottle_with_timeout(
    endpoint: &Endpoint,
    msg: &Value,
    connect_timeout: Duration,
) -> bool {
    let Some(mut stream) = get_connection(endpoint, connect_timeout).await else {
        return false;
    };
    let frame = match Frame::new(msg) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "Failed to encode bottle");
            return false;
        }
    };
    match timeout(connect_timeout.max(BOTTLE_TIMEOUT * 10), write_frame(&mut stream, &frame)).await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(endpoint = %endpoint, error = %e, "Bottle send failed");
            false
        }
        Err(_) => {
            debug!(endpoint = %endpoint, "Bottle send timed out");
            false
        }
    }
}

/// Send one frame over an already-open connection, leaving it open.
pub async fn send_signal_with_conn(stream: &mut TcpStream, msg: &Value) -> bool {
    let frame = match Frame::new(msg) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "Failed to encode signal");
            return false;
        }
    };
    match write_frame(stream, &frame).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Send over connection failed");
            false
        }
    }
}

/// Read exactly one frame and decode it.
///
/// `None` when the peer closes before the frame is complete or the payload is
/// not valid JSON.
pub async fn recv_signal<R>(reader: &mut R) -> Option<Value>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match read_frame(reader).await {
        Ok(frame) => match frame.to_value() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                None
            }
        },
        Err(e) => {
            debug!(error = %e, "No frame received");
            None
        }
    }
}

/// Find the first port in `[start, 65535)` on `host` that can be bound.
///
/// Ports listed in `skip` are never returned. The probe binds and releases
/// each candidate, so a port can still be taken by someone else between the
/// probe and the caller's own bind.
pub fn probe_free_port(host: &str, start: u16, skip: &[u16]) -> Option<u16> {
    for port in start..u16::MAX {
        if skip.contains(&port) {
            continue;
        }
        if std::net::TcpListener::bind((host, port)).is_ok() {
            debug!(host, port, "Free port found");
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("192.168.1.4:50333"),
            Some(Endpoint::new("192.168.1.4", 50333))
        );
        assert_eq!(
            Endpoint::parse("[::1]:11111"),
            Some(Endpoint::new("::1", 11111))
        );
        assert_eq!(Endpoint::parse("nohost"), None);
        assert_eq!(Endpoint::parse(":80"), None);
        assert_eq!(Endpoint::parse("host:notaport"), None);
    }

    #[test]
    fn test_endpoint_serializes_as_tuple() {
        let endpoint = Endpoint::new("studio-team", 50333);
        let value = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(value, json!(["studio-team", 50333]));

        let back: Endpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::localhost(10231).to_string(), "127.0.0.1:10231");
        assert_eq!(Endpoint::new("::1", 5).to_string(), "[::1]:5");
    }

    #[tokio::test]
    async fn test_listen_reports_bind_error_when_taken() {
        let (_listener, addr) = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = listen(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_get_connection_refused_is_none() {
        let port = probe_free_port("127.0.0.1", 20000, &[]).unwrap();
        let conn = get_connection(&Endpoint::localhost(port), PROBE_TIMEOUT).await;
        assert!(conn.is_none());
    }

    #[tokio::test]
    async fn test_send_bottle_without_listener_fails_fast() {
        let port = probe_free_port("127.0.0.1", 21000, &[]).unwrap();
        let started = std::time::Instant::now();
        assert!(!send_bottle(&Endpoint::localhost(port), &json!({"type": "test_conn"})).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_probe_free_port_skips_reserved_and_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let port = probe_free_port("127.0.0.1", taken_port, &[taken_port + 1]).unwrap();
        assert_ne!(port, taken_port);
        assert_ne!(port, taken_port + 1);
        assert!(port > taken_port);
    }
}
