use std::io;
use thiserror::Error;

/// Failure modes of a single probe request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request exceeded its deadline. Counted toward the timing
    /// tie-break in the detect loop.
    #[error("timeout")]
    Timeout,

    /// The server tore the connection down (GOAWAY, RST_STREAM or a QUIC
    /// application error). A common legitimate reaction to a malformed
    /// probe, so it is never retried and logged only at debug level.
    #[error("server dropped connection, error={0}")]
    ConnDrop(String),

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid scheme {0:?}")]
    InvalidScheme(String),

    #[error("lookup for {name:?} failed: {reason}")]
    Dns { name: String, reason: String },

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("quic error: {0}")]
    Quic(#[from] quiche::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frames or header blocks in the server's response.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RequestError {
    /// Whether a retry may help. Mirrors the timeout/temporary split of
    /// socket errors: everything else fails the sample immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Timeout => true,
            RequestError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            RequestError::Timeout => true,
            RequestError::Io(e) => {
                matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

/// Maps a blocking-socket failure to [`RequestError`], folding the two
/// timeout kinds into [`RequestError::Timeout`].
pub fn from_socket_error(e: io::Error) -> RequestError {
    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
        RequestError::Timeout
    } else {
        RequestError::Io(e)
    }
}
