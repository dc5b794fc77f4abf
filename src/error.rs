//! Error types for startup, certificate provisioning and upstream forwarding

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring the proxy or provisioning certificates.
///
/// Every variant is fatal to the invocation that produced it: a bad mapping
/// or a missing certificate stops the proxy before any listener opens, and a
/// key generation or persistence failure aborts `setup`.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed mapping specification
    #[error("mapping error: {message}\ne.g.\ttlsmux --map '*:3000,someapp:4000'")]
    Config { message: String },

    /// Certificate or key file is absent
    #[error(
        "unable to find TLS certificate at {}, make sure you run setup first\ne.g.\ttlsmux setup --host='*.local.dev,local.dev'",
        path.display()
    )]
    NotFound { path: PathBuf },

    /// Invalid key parameters or key backend failure
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Generated material could not be written
    #[error("failed to write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// PEM files exist but do not hold usable material
    #[error("invalid certificate material in {}: {reason}", path.display())]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

/// Failure to obtain a response from a backend.
///
/// Contained to the request that hit it; the frontend turns it into a 502.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("backend on port {port} did not respond within {secs}s")]
    Timeout { port: u16, secs: u64 },

    #[error("backend on port {port} did not finish its response within {secs}s")]
    Stalled { port: u16, secs: u64 },

    #[error("no route for host {host:?}")]
    Unrouted { host: String },
}
