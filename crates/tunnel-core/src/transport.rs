//! Abstract transport and callback surface for the tunnel server.
//!
//! The transport owns framing, encryption, authentication and channel
//! multiplexing for one connection. The forwarding subsystem only needs the
//! narrow view below: accept the next peer-opened channel, open a
//! server-originated channel, and know who is on the other end.

use crate::error::{OpenFailure, TunnelResult};
use futures_util::future::BoxFuture;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream (a logical channel or a TCP socket).
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A logical channel with its transport-scoped id.
pub struct IdentifiedChannel {
    pub id: u32,
    pub stream: Box<dyn ByteStream>,
}

impl IdentifiedChannel {
    pub fn new(id: u32, stream: impl ByteStream + 'static) -> Self {
        Self {
            id,
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for IdentifiedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifiedChannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Logical channel types the tunnel server deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Session,
    DirectTcpip,
    ForwardedTcpip,
}

impl ChannelKind {
    /// Wire name of the channel type.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip => "direct-tcpip",
            ChannelKind::ForwardedTcpip => "forwarded-tcpip",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "session" => Some(ChannelKind::Session),
            "direct-tcpip" => Some(ChannelKind::DirectTcpip),
            "forwarded-tcpip" => Some(ChannelKind::ForwardedTcpip),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host/port pair as carried in channel-open requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
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

    /// `host:port` string suitable for `TcpStream::connect`.
    ///
    /// IPv6 literals are bracketed.
    pub fn connect_target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Server-side view of one authenticated, multiplexed connection.
///
/// Shared by every worker of the connection, hence `&self` everywhere.
pub trait Transport: Send + Sync {
    /// Wait up to `timeout` for the next channel the peer opens.
    ///
    /// Returns `Ok(None)` on timeout. The returned future must be cancel-safe:
    /// dropping it before completion must not lose a channel.
    fn accept_channel(&self, timeout: Duration) -> BoxFuture<'_, TunnelResult<Option<IdentifiedChannel>>>;

    /// Open a server-originated channel towards the peer.
    fn open_channel<'a>(
        &'a self,
        kind: ChannelKind,
        origin: &'a Endpoint,
        destination: &'a Endpoint,
    ) -> BoxFuture<'a, TunnelResult<IdentifiedChannel>>;

    /// Name of the authenticated principal.
    fn principal(&self) -> String;

    /// Whether the underlying connection is still up.
    fn is_connected(&self) -> bool;
}

/// Callbacks a transport drives while serving one connection.
///
/// Implementations must never fail the dispatch: every error is turned into
/// the reply value.
pub trait ConnectionHandler: Send + Sync {
    /// Gate for channel-open requests other than direct-tcpip.
    fn check_channel_request(&self, kind: ChannelKind, channel_id: u32) -> Result<(), OpenFailure>;

    /// PTY request on a session channel.
    fn on_pty_request(&self, channel_id: u32) -> bool;

    /// Shell request on a session channel. The handler takes ownership of the
    /// channel.
    fn on_shell_request(&self, channel: IdentifiedChannel) -> BoxFuture<'_, bool>;

    /// `tcpip-forward` global request. Returns the bound port, or `None` to
    /// refuse.
    fn on_forward_request<'a>(&'a self, address: &'a str, port: u16) -> BoxFuture<'a, Option<u16>>;

    /// `cancel-tcpip-forward` global request.
    fn on_cancel_forward<'a>(&'a self, address: &'a str, port: u16) -> BoxFuture<'a, ()>;

    /// `direct-tcpip` channel-open request. On `Ok`, the transport delivers
    /// the channel through [`Transport::accept_channel`].
    fn on_direct_request<'a>(
        &'a self,
        channel_id: u32,
        origin: &'a Endpoint,
        destination: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(), OpenFailure>>;

    /// The connection is going away.
    fn on_disconnect(&self) -> BoxFuture<'_, ()>;
}
