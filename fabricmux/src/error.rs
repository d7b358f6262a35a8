use thiserror::Error;

/// All errors produced by the fabricmux transport layer.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("frame payload length {len} exceeds cap {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("stream {0} not found")]
    StreamNotFound(u16),

    #[error("stream {0} already exists")]
    StreamAlreadyExists(u16),

    #[error("invalid state transition on stream {stream}: {from} -> {to}")]
    InvalidStateTransition {
        stream: u16,
        from: &'static str,
        to: &'static str,
    },

    #[error("broken pipe: stream {0} is not established")]
    BrokenPipe(u16),

    #[error("dial to {network}:{address} timed out")]
    DialTimeout { network: String, address: String },

    #[error("dial to {network}:{address} refused (code {code})")]
    DialRefused {
        network: String,
        address: String,
        code: u32,
    },

    #[error("no free stream ids remain in the 16-bit space")]
    IdExhausted,

    #[error("fabric is closed")]
    FabricClosed,

    #[error("queue is closed")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FabricError>;

/// Normative RESULT-frame error codes (see `crate::frame`).
pub mod code {
    pub const ERR_NONE: u32 = 0;
    pub const ERR_TIMEOUT: u32 = 1;
    pub const ERR_CLOSED: u32 = 2;
    pub const ERR_REFUSED: u32 = 3;
    pub const ERR_IDEXHAUSTED: u32 = 4;
}

impl FabricError {
    /// Translate this error into a `std::io::Error` for consumers of the
    /// `Stream`'s `Read`/`Write` impls, which must speak `io::Error`.
    pub fn into_io_error(self) -> std::io::Error {
        use std::io::{Error, ErrorKind};
        match self {
            FabricError::Io(e) => e,
            FabricError::BrokenPipe(_) => Error::new(ErrorKind::BrokenPipe, self.to_string()),
            FabricError::DialTimeout { .. } => Error::new(ErrorKind::TimedOut, self.to_string()),
            FabricError::FabricClosed | FabricError::QueueClosed => {
                Error::new(ErrorKind::NotConnected, self.to_string())
            }
            other => Error::new(ErrorKind::Other, other.to_string()),
        }
    }
}
