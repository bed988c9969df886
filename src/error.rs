//! Error types for the relay.

use std::path::PathBuf;

/// Custom error types for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Could not open connection to {host} on port {port}: {reason}")]
    Handshake {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication rejected for user '{0}'")]
    AuthRejected(String),

    #[error("Failed dialing {address} through the SSH session: {source}")]
    Channel {
        address: String,
        #[source]
        source: russh::Error,
    },

    #[error("Unsupported network '{0}', only tcp can be dialed")]
    UnsupportedNetwork(String),

    #[error("Invalid address '{0}', expected host:port")]
    InvalidAddress(String),

    #[error("Could not start listener on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Cache file {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse cache file {path}: {source}")]
    CacheParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    KeyError(#[from] russh_keys::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::Config("bad flag".to_string());
        assert_eq!(format!("{}", err), "Invalid configuration: bad flag");

        let err = TunnelError::Handshake {
            host: "example.com".to_string(),
            port: 22,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Could not open connection to example.com on port 22: connection refused"
        );

        let err = TunnelError::UnsupportedNetwork("udp".to_string());
        assert_eq!(
            format!("{}", err),
            "Unsupported network 'udp', only tcp can be dialed"
        );
    }

    #[test]
    fn test_tunnel_error_debug() {
        let err = TunnelError::AuthRejected("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("AuthRejected"));
    }
}
