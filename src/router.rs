//! Host header based routing
//! Picks the backend port from the first label of the request host

use crate::mapping::MappingTable;
use hyper::header::HOST;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, Uri};

/// Where a request should be forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to `localhost:<port>`
    Backend(u16),
    /// Neither the subdomain nor a wildcard is mapped
    Unrouted,
}

impl RouteDecision {
    pub fn port(&self) -> Option<u16> {
        match self {
            RouteDecision::Backend(port) => Some(*port),
            RouteDecision::Unrouted => None,
        }
    }

    /// Rewrite `uri` to target the backend over plain HTTP.
    ///
    /// Only scheme and authority change; path and query are kept.
    pub fn upstream_uri(&self, uri: &Uri) -> Option<Uri> {
        let port = self.port()?;
        let authority: Authority = format!("localhost:{}", port).parse().ok()?;
        let path_and_query = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .ok()
    }
}

/// First dot-separated label of a host, without any port suffix
pub fn subdomain(host: &str) -> &str {
    let label = host.split('.').next().unwrap_or(host);
    label.split(':').next().unwrap_or(label)
}

/// Resolve a host to a route decision
pub fn route(table: &MappingTable, host: &str) -> RouteDecision {
    match table.lookup(subdomain(host)) {
        Some(port) => RouteDecision::Backend(port),
        None => RouteDecision::Unrouted,
    }
}

/// Host the client asked for: the `Host` header, else the URI authority
pub fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}
