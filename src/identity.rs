//! Deriving the bucket identity of an HTTP request.
//!
//! The identity is taken from a forwarded-address header when present, else from the
//! transport peer. Both are untrusted: the value is used only as an opaque grouping key
//! and never parsed. A client talking to the service directly can put anything in the
//! header, so deployments behind a known proxy should restrict trust with
//! [`ProxyTrust::Only`].

use http::{HeaderName, Request};
use std::net::{IpAddr, SocketAddr};

/// Identity shared by every request that carries neither a usable header nor a peer address.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Transport peer address, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Which peers may supply the identity through the forwarded-address header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyTrust {
    /// Honour the header from anyone.
    #[default]
    Any,
    /// Honour the header only when the peer is one of these proxies.
    Only(Vec<IpAddr>),
    /// Ignore the header; always use the peer address.
    Never,
}

/// Extracts the identity key from requests.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    header: HeaderName,
    trust: ProxyTrust,
}

impl Default for IdentityExtractor {
    fn default() -> Self {
        Self { header: HeaderName::from_static("x-forwarded-for"), trust: ProxyTrust::Any }
    }
}

impl IdentityExtractor {
    /// `X-Forwarded-For`, trusted from any peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the identity from `header` instead of `X-Forwarded-For`.
    pub fn with_header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }

    pub fn with_trust(mut self, trust: ProxyTrust) -> Self {
        self.trust = trust;
        self
    }

    /// Identity of `req`: the trusted header value verbatim, else the peer IP, else
    /// [`UNKNOWN_IDENTITY`].
    pub fn identify<B>(&self, req: &Request<B>) -> String {
        let peer = req.extensions().get::<PeerAddr>().map(|p| p.0.ip());

        if self.trusts(peer) {
            let forwarded = req
                .headers()
                .get(&self.header)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(value) = forwarded {
                return value.to_owned();
            }
        }

        peer.map_or_else(|| UNKNOWN_IDENTITY.to_owned(), |ip| ip.to_string())
    }

    fn trusts(&self, peer: Option<IpAddr>) -> bool {
        match &self.trust {
            ProxyTrust::Any => true,
            ProxyTrust::Only(proxies) => peer.map_or(false, |ip| proxies.contains(&ip)),
            ProxyTrust::Never => false,
        }
    }
}
