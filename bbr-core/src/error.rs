use thiserror::Error;

/// Domain error type shared by every core component.
///
/// Adapters at the edges of the engine (sockets, the CLI, the NCP line
/// protocol) wrap these in `anyhow::Error`; nothing in `bbr-core` ever
/// constructs an `anyhow::Error` directly.
#[derive(Debug, Error)]
pub enum BbrError {
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),

    #[error("registry: {0}")]
    Registry(String),

    #[error("not primary")]
    NotPrimary,

    #[error("config: {0}")]
    Config(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BbrError>;

/// Errors raised while parsing or building Thread TLV lists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("truncated TLV header")]
    TruncatedHeader,

    #[error("TLV length {length} exceeds remaining buffer of {remaining} bytes")]
    LengthOutOfBounds { length: usize, remaining: usize },

    #[error("extended-length TLVs (length byte 0xFF) are not supported by this protocol")]
    ExtendedLengthUnsupported,
}
