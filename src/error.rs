use std::io;

/// The error type shared by the codec, the storage workers, the server and the client.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The connection was closed before any command byte arrived.
    #[error("connection closed before a command was received")]
    NoCommand,
    /// The requested file does not exist in the storage root.
    #[error("file not found: {0}")]
    NotFound(String),
    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A socket read or write did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The socket failed mid-exchange.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer answered with a textual reply where a payload or handshake was expected.
    #[error("peer replied: {0}")]
    Remote(String),
    /// The dispatch pool could not run the operation.
    #[error("worker pool error: {0}")]
    Pool(String),
}

impl TransferError {
    /// Wrap a socket error, keeping timeouts distinguishable from other failures.
    pub fn transport(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Timeout(err.to_string())
            }
            _ => Self::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classifies_timeouts() {
        let err = TransferError::transport(io::Error::new(io::ErrorKind::TimedOut, "slow peer"));
        assert!(matches!(err, TransferError::Timeout(_)));

        let err = TransferError::transport(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, TransferError::Transport(_)));
    }

    #[test]
    fn test_io_error_converts() {
        let err: TransferError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.to_string(), "I/O error: nope");
    }
}
