//! Config-backed credential checks.
//!
//! HTTP callers use `Authorization: Basic <base64(username:password)>`; hubs
//! use `Authorization: Bearer <access token>`. Secrets are stored as hex
//! SHA-256 digests in the `[[channels]]` config entries.

use super::AuthorizationService;
use crate::config::ChannelCredentials;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hubrelay_core::{AuthorizationContext, RelayError, RelayResult};
use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::debug;

pub struct CredentialStore {
    channels: Vec<ChannelCredentials>,
}

impl CredentialStore {
    pub fn new(channels: Vec<ChannelCredentials>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    fn context_of(entry: &ChannelCredentials) -> AuthorizationContext {
        AuthorizationContext::new(entry.identity_uid.clone(), entry.channel_uid.clone())
    }
}

impl AuthorizationService for CredentialStore {
    fn authorize_request(&self, headers: &HeaderMap) -> RelayResult<AuthorizationContext> {
        let encoded = authorization_value(headers, "Basic")?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| RelayError::Unauthorized("malformed basic credentials".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| RelayError::Unauthorized("malformed basic credentials".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| RelayError::Unauthorized("malformed basic credentials".into()))?;

        let digest = sha256_hex(password);
        self.channels
            .iter()
            .find(|c| c.username == username && c.password_sha256.eq_ignore_ascii_case(&digest))
            .map(Self::context_of)
            .ok_or_else(|| {
                debug!(username, "rejected basic credentials");
                RelayError::Unauthorized("invalid username or password".into())
            })
    }

    fn authorize_connection(&self, headers: &HeaderMap) -> RelayResult<AuthorizationContext> {
        let token = authorization_value(headers, "Bearer")?;
        let digest = sha256_hex(token);
        self.channels
            .iter()
            .find(|c| {
                c.access_token_sha256
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(&digest))
            })
            .map(Self::context_of)
            .ok_or_else(|| RelayError::Unauthorized("invalid access token".into()))
    }
}

/// Extract the credentials following `scheme` in the `Authorization` header.
fn authorization_value<'a>(headers: &'a HeaderMap, scheme: &str) -> RelayResult<&'a str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| RelayError::Unauthorized("missing authorization header".into()))?
        .to_str()
        .map_err(|_| RelayError::Unauthorized("malformed authorization header".into()))?;

    let (given_scheme, rest) = value
        .split_once(' ')
        .ok_or_else(|| RelayError::Unauthorized("malformed authorization header".into()))?;
    if !given_scheme.eq_ignore_ascii_case(scheme) {
        return Err(RelayError::Unauthorized(format!(
            "expected {scheme} authorization"
        )));
    }
    Ok(rest.trim())
}

/// Hex-encoded SHA-256 of a secret, as stored in the config.
pub fn sha256_hex(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
