//! Error types for the proxy.
//!
//! Construction-time errors ([`ConfigError`]) are synchronous and fatal.
//! `start()` failures surface through the `Error` lifecycle event. Every
//! post-start error is per-connection and isolated: one failing connection
//! never takes down the listener.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid construction parameters.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Operation invoked from an invalid lifecycle state.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Certificate authority failure.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Listener bind failure.
    #[error("Listen error: {0}")]
    Listen(#[source] std::io::Error),

    /// DNS/connect/handshake failure toward the target host.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error on the client-facing side.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP protocol error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Monitoring interface failure during startup.
    #[error("Monitor error: {0}")]
    Monitor(String),
}

/// Invalid construction parameters; the server never starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No listen port was given.
    #[error("proxy port is required")]
    MissingPort,

    /// An https-type proxy needs a hostname for its own certificate.
    #[error("hostname is required for an https proxy")]
    MissingHostname,

    /// Throttle rates must be positive integers (KB/s).
    #[error("invalid throttle rate, must be a positive integer")]
    InvalidThrottle,

    /// Forced HTTPS interception needs root CA material on disk.
    #[error("root CA not found, cannot intercept https")]
    RootCaMissing,
}

/// Operation invoked from an invalid lifecycle state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// `start()` is only valid on a freshly constructed server.
    #[error("server status is {status}, cannot start")]
    NotInit {
        /// The status the server was in.
        status: &'static str,
    },

    /// A failed `start()` poisons the instance; build a new one.
    #[error("a previous start() failed, this instance cannot be restarted")]
    Poisoned,
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Root key/certificate material is missing from durable storage.
    #[error("root CA material not found at {0}")]
    RootMissing(String),

    /// Failed to read or write CA material.
    #[error("CA storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse persisted CA material.
    #[error("failed to parse CA material: {0}")]
    Parse(String),

    /// Key generation or signing failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// The requested hostname cannot go into a certificate.
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
}

/// Failure reaching or speaking to the target host.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// TCP connect failed.
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Upstream TLS handshake failed.
    #[error("upstream TLS handshake with {host} failed: {reason}")]
    Tls {
        /// Target host.
        host: String,
        /// Handshake failure detail.
        reason: String,
    },

    /// HTTP exchange with the upstream failed.
    #[error("upstream HTTP error: {0}")]
    Http(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_name_the_violated_invariant() {
        assert_eq!(ConfigError::MissingPort.to_string(), "proxy port is required");
        assert!(ConfigError::MissingHostname.to_string().contains("hostname"));
        assert!(ConfigError::InvalidThrottle.to_string().contains("throttle"));
        assert!(ConfigError::RootCaMissing.to_string().contains("root CA"));
    }

    #[test]
    fn state_error_carries_current_status() {
        let err = StateError::NotInit { status: "READY" };
        assert_eq!(err.to_string(), "server status is READY, cannot start");
    }

    #[test]
    fn upstream_connect_error_names_target() {
        let err = UpstreamError::Connect {
            host: "example.com".into(),
            port: 443,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        let msg = err.to_string();
        assert!(msg.contains("example.com:443"));
    }
}
