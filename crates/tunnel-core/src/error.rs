use std::fmt;
use thiserror::Error;

/// Reason a logical channel could not be opened.
///
/// Discriminants are the SSH channel-open failure reason codes (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl OpenFailure {
    /// Wire reason code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a wire reason code back to a variant.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        };
        f.write_str(text)
    }
}

/// Errors produced by the tunnel layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel open refused: {0}")]
    ChannelOpen(OpenFailure),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("forward already registered: {0}")]
    ForwardExists(String),

    #[error("forward not found: {0}")]
    ForwardNotFound(String),

    #[error("port mismatch: wanted {requested}, got {bound}")]
    PortMismatch { requested: u16, bound: u16 },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    /// The channel-open reason to report to the peer for this error.
    pub fn open_failure(&self) -> OpenFailure {
        match self {
            TunnelError::ChannelOpen(reason) => *reason,
            TunnelError::PermissionDenied(_) => OpenFailure::AdministrativelyProhibited,
            TunnelError::LimitReached(_) => OpenFailure::ResourceShortage,
            _ => OpenFailure::ConnectFailed,
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
