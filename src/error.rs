use std::io;

use thiserror::Error;

/// Failure of a single proxied connection. None of these ever reach the
/// client as an HTTP response; they only end up in the log.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed request line: {0:?}")]
    MalformedRequest(String),

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("short TLS record header: {0}")]
    ShortHead(#[source] io::Error),

    #[error("failed to read initial payload: {0}")]
    ShortRead(#[source] io::Error),

    #[error("write failed: {0}")]
    WriteFailure(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Peer hangups are routine for a proxy and only worth a trace line.
    pub fn is_expected(&self) -> bool {
        match self {
            ProxyError::ShortHead(e)
            | ProxyError::ShortRead(e)
            | ProxyError::WriteFailure(e)
            | ProxyError::Io(e) => is_expected_io(e),
            _ => false,
        }
    }
}

pub fn is_expected_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
