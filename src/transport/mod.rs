//! Transports: where formatted messages go.
//!
//! The contract is deliberately narrow — `send(key, payload)`, an optional
//! error stream, `close()` to flush. Delivery is not guaranteed; transport
//! errors are muted and counted, never fatal.

pub mod file;

pub use file::FileTransport;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("transport is closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

pub trait Transport: Send + Sync {
    fn send(&self, key: &[u8], payload: &[u8]) -> Result<(), TransportError>;

    /// Asynchronous error stream, when the transport has one. Errors
    /// surfaced here are routed through the error muter by the supervisor.
    fn errors(&self) -> Option<async_channel::Receiver<TransportError>> {
        None
    }

    /// Flushes and releases the sink. Sends after close fail.
    fn close(&self);
}

/// Transport registry, mirroring the `--transport` flag values.
pub fn find_transport(name: &str, file_path: Option<&Path>) -> Option<Arc<dyn Transport>> {
    match name {
        "file" => Some(match file_path {
            Some(path) => match FileTransport::create(path) {
                Ok(transport) => Arc::new(transport),
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "cannot open transport file");
                    return None;
                }
            },
            None => Arc::new(FileTransport::stdout()),
        }),
        _ => None,
    }
}

pub fn transports() -> &'static [&'static str] {
    &["file"]
}
