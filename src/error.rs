//! Error types for the audio link

use std::io;
use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Capture and playout device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone capture is not authorized")]
    PermissionDenied,

    #[error("Capture failed: {0}")]
    CaptureError(String),

    #[error("Playout failed: {0}")]
    PlayoutError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: {len} bytes")]
    MalformedPacket { len: usize },
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

impl NetworkError {
    /// Classify a socket error raised while probing or sending.
    ///
    /// `ConnectionRefused` is what a connected UDP socket reports after an
    /// ICMP port-unreachable, i.e. nothing listens at the target.
    pub fn from_send(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown => {
                NetworkError::ServerUnreachable(err.to_string())
            }
            io::ErrorKind::HostUnreachable | io::ErrorKind::ConnectionRefused => {
                NetworkError::HostUnreachable(err.to_string())
            }
            io::ErrorKind::PermissionDenied => NetworkError::PermissionDenied(err.to_string()),
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                NetworkError::AddressInvalid(err.to_string())
            }
            _ => NetworkError::SendFailed(err.to_string()),
        }
    }

    /// Errors that end a streaming session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::ServerUnreachable(_)
                | NetworkError::HostUnreachable(_)
                | NetworkError::PermissionDenied(_)
        )
    }

    /// Map a transient send error to the connect-time taxonomy.
    pub(crate) fn into_connect_error(self) -> Self {
        match self {
            NetworkError::SendFailed(reason) | NetworkError::ReceiveFailed(reason) => {
                NetworkError::ServerUnreachable(reason)
            }
            other => other,
        }
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_classification() {
        let err = io::Error::from(io::ErrorKind::NetworkUnreachable);
        assert!(matches!(NetworkError::from_send(&err), NetworkError::ServerUnreachable(_)));

        let err = io::Error::from(io::ErrorKind::HostUnreachable);
        assert!(matches!(NetworkError::from_send(&err), NetworkError::HostUnreachable(_)));

        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(NetworkError::from_send(&err), NetworkError::HostUnreachable(_)));

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(NetworkError::from_send(&err), NetworkError::PermissionDenied(_)));

        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(NetworkError::from_send(&err), NetworkError::SendFailed(_)));
    }

    #[test]
    fn test_fatal_subset() {
        assert!(NetworkError::ServerUnreachable(String::new()).is_fatal());
        assert!(NetworkError::HostUnreachable(String::new()).is_fatal());
        assert!(NetworkError::PermissionDenied(String::new()).is_fatal());
        assert!(!NetworkError::SendFailed(String::new()).is_fatal());
        assert!(!NetworkError::NotConnected.is_fatal());
        assert!(!NetworkError::AddressInvalid(String::new()).is_fatal());
    }

    #[test]
    fn test_connect_error_mapping() {
        let err = NetworkError::SendFailed("timed out".into()).into_connect_error();
        assert!(matches!(err, NetworkError::ServerUnreachable(_)));

        let err = NetworkError::HostUnreachable("refused".into()).into_connect_error();
        assert!(matches!(err, NetworkError::HostUnreachable(_)));
    }
}
