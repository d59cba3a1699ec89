//! Authorization of HTTP callers and hub connections.
//!
//! The connector and tunnel only depend on the [`AuthorizationService`]
//! trait; [`CredentialStore`] is the config-backed implementation used by
//! the binary.

pub mod credentials;

pub use credentials::CredentialStore;

use hubrelay_core::{AuthorizationContext, RelayResult};
use hyper::HeaderMap;

/// Resolves credentials into the identity of a hub.
pub trait AuthorizationService: Send + Sync {
    /// Authorize an HTTP request that should be tunneled to a hub.
    fn authorize_request(&self, headers: &HeaderMap) -> RelayResult<AuthorizationContext>;

    /// Authorize a hub opening its persistent connection.
    fn authorize_connection(&self, headers: &HeaderMap) -> RelayResult<AuthorizationContext>;
}
