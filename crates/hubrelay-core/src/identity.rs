//! Authorization identity of a hub connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one hub/account pairing.
///
/// Produced by the authorization layer both when a hub connects and when an
/// HTTP request is authorized; the two meet in the session registry, which is
/// keyed by the context itself. The `Display` form is for logs only and is not
/// unique (`"a/b"`+`"c"` and `"a"`+`"b/c"` print alike).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub identity_uid: String,
    pub channel_uid: String,
}

impl AuthorizationContext {
    pub fn new(identity_uid: impl Into<String>, channel_uid: impl Into<String>) -> Self {
        Self {
            identity_uid: identity_uid.into(),
            channel_uid: channel_uid.into(),
        }
    }
}

impl fmt::Display for AuthorizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity_uid, self.channel_uid)
    }
}
