//! tlsmux - A TLS-terminating reverse proxy for local development
//!
//! Provides:
//! - Subdomain routing to local backend ports (`app.local.dev` -> `localhost:5000`)
//! - Self-signed certificate provisioning and loading
//! - Forwarding headers and one access log line per request
//! - Optional plain HTTP listener sharing the same pipeline

pub mod access_log;
pub mod certificate;
pub mod error;
pub mod mapping;
pub mod proxy;
pub mod router;
pub mod transport;

pub use access_log::{AccessLogEntry, AccessLogSink, TracingAccessLog};
pub use certificate::{
    CertificateAuthority, CertificateManager, CertificateRequest, Curve, KeySpec,
    SelfSignedAuthority, TlsMaterial,
};
pub use error::{Error, Result, UpstreamError};
pub use mapping::MappingTable;
pub use proxy::{ProxyConfig, ProxyHandler, ProxyServer};
pub use router::{route, RouteDecision};
pub use transport::{UpstreamOutcome, UpstreamTransport};
