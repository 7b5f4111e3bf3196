//! Gateway module: the two protocol listeners of the captive portal.
//!
//! # Submodule Architecture
//!
//! - **[`dns`]**: the [`DnsInterceptor`] answers every query from a blocked
//!   client with the portal address and relays queries from allowed clients
//!   to the upstream resolver.
//! - **[`http`]**: the [`HttpGateway`] serves the login page, checks
//!   credentials, flips clients between blocked and allowed and serves
//!   static files.
//! - **[`limit`]**: the [`TaskLimiter`] caps in-flight per-request tasks for
//!   each listener.
//!
//! Both listeners share one [`portal_core::AuthorizationTable`].
//!
//! # Data Flow
//!
//! ```text
//! client DNS query
//!   → DnsInterceptor::handle_query
//!       → blocked: RedirectResponse (portal address)
//!       → allowed: relay to upstream
//! browser → portal address
//!   → HttpGateway::handle_connection
//!       → login ok: AuthorizationTable::allow + Firewall::release_client
//! ```

pub mod dns;
pub mod http;
pub mod limit;

pub use dns::DnsInterceptor;
pub use http::HttpGateway;
pub use limit::TaskLimiter;

use std::net::{IpAddr, SocketAddr};

/// Client identity used as the authorization key. IPv4-mapped IPv6 peers
/// (seen on dual-stack sockets) are folded back to IPv4.
pub(crate) fn client_ip(addr: SocketAddr) -> IpAddr {
    addr.ip().to_canonical()
}
