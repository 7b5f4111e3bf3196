//! portal-core: shared library for the LAN captive portal.
//!
//! Provides the per-client authorization table, the minimal DNS wire codec
//! used to redirect unauthenticated clients, HTTP request-line parsing,
//! the JSON credential store and page templates.

pub mod authz;
pub mod credentials;
pub mod dns;
pub mod error;
pub mod http;
pub mod template;

// Re-export commonly used items at crate root.
pub use authz::{AuthorizationTable, ClientState};
pub use credentials::{CredentialStore, JsonUserStore};
pub use dns::{DnsQuery, RedirectResponse};
pub use error::{PortalError, PortalResult};
pub use http::HttpRequest;
pub use template::Templates;
