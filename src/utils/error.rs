use crate::resolve::Address;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no address group for name: {0}")]
    NameNotFound(String),

    #[error("maximum outbound sockets already in use for {name}: {in_use}")]
    OutOfSockets { name: String, in_use: usize },

    #[error("endpoint {0} is marked down")]
    MarkedDown(Address),

    #[error("all {} connect candidates failed", .0.len())]
    MultiConnectFailure(Vec<(Address, UplinkError)>),

    #[error("invalid address group: {0}")]
    InvalidAddressGroup(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UplinkError>;

impl UplinkError {
    /// Closest `io::ErrorKind` for callers that sort errors by kind.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            UplinkError::Io(err) => err.kind(),
            UplinkError::NameNotFound(_) => io::ErrorKind::NotFound,
            UplinkError::MarkedDown(_) => io::ErrorKind::ConnectionRefused,
            UplinkError::InvalidAddressGroup(_) | UplinkError::Config(_) => {
                io::ErrorKind::InvalidInput
            }
            UplinkError::OutOfSockets { .. } | UplinkError::MultiConnectFailure(_) => {
                io::ErrorKind::Other
            }
        }
    }
}

// Existing callers that handle any socket error keep working through this
// conversion; the `Io` kind passes the underlying error through verbatim.
impl From<UplinkError> for io::Error {
    fn from(err: UplinkError) -> io::Error {
        match err {
            UplinkError::Io(inner) => inner,
            other => io::Error::new(other.io_kind(), other.to_string()),
        }
    }
}
