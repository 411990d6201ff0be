use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version: 0x{0:02x}")]
    BadVersion(u8),

    #[error("reserved field is non-zero")]
    ReservedNonZero,

    #[error("no acceptable authentication methods")]
    NoAcceptableMethods,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closed before a full request header was received")]
    IncompleteHeader,
}

impl ProxyError {
    /// True when the client disconnected before even the fixed-size request
    /// header (VER/CMD/RSV/ATYP) arrived. The stream was never aligned on a
    /// record boundary in the first place, so closing silently is the only
    /// option; any later parse failure has a decoded header to reply about.
    pub fn is_short_read(&self) -> bool {
        matches!(self, ProxyError::IncompleteHeader)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
