//! Client identification.
//!
//! Quotas are partitioned by a stable identity string: the authenticated
//! principal when an upstream auth step attached one, otherwise the network
//! origin (first hop of a trusted forwarding header, else the peer address).

use std::net::SocketAddr;

use http::header::HeaderName;
use http::Request;

use crate::error::ConfigError;

/// Header consulted for the original client address behind a proxy.
pub const DEFAULT_FORWARDED_HEADER: &str = "x-forwarded-for";

/// Origin used when neither a forwarding header nor a peer address is available.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Principal resolved by an earlier authentication step, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedPrincipal(pub String);

/// Direct peer address of the connection, stored in request extensions by the host server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub SocketAddr);

/// Derives the identity string used to partition quotas.
#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    forwarded_header: HeaderName,
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self { forwarded_header: HeaderName::from_static(DEFAULT_FORWARDED_HEADER) }
    }
}

impl ClientIdentifier {
    /// Identifier trusting `header` as the forwarding header.
    pub fn with_forwarded_header(header: &str) -> Result<Self, ConfigError> {
        let forwarded_header = HeaderName::from_bytes(header.as_bytes()).map_err(|source| {
            ConfigError::InvalidHeaderName { name: header.to_string(), source }
        })?;
        Ok(Self { forwarded_header })
    }

    /// The trusted forwarding header.
    pub fn forwarded_header(&self) -> &HeaderName {
        &self.forwarded_header
    }

    /// `"user:<principal>"` or `"ip:<origin>"`; never empty.
    pub fn identify<B>(&self, req: &Request<B>) -> String {
        if let Some(AuthenticatedPrincipal(id)) = req.extensions().get::<AuthenticatedPrincipal>() {
            return format!("user:{id}");
        }
        format!("ip:{}", self.origin(req))
    }

    fn origin<B>(&self, req: &Request<B>) -> String {
        let forwarded = req
            .headers()
            .get(&self.forwarded_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first_hop) = forwarded {
            return first_hop.to_string();
        }
        match req.extensions().get::<PeerAddr>() {
            Some(PeerAddr(addr)) => addr.ip().to_string(),
            None => UNKNOWN_ORIGIN.to_string(),
        }
    }
}
