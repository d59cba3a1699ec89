//! Cloud message envelope and the content shapes carried inside it.
//!
//! Every unit exchanged with a hub is a [`CloudMessage`]: a numeric type tag,
//! an optional correlation id linking a request to its reply, and an opaque
//! CBOR content value. Typed content is converted in and out with
//! [`CloudMessageFactory::create_message`] and [`CloudMessage::content_as`].

use crate::error::{RelayError, RelayResult};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric message type tags.
///
/// Unknown tags decode to [`CloudMessageType::Other`] so that newer hubs can
/// introduce message kinds without breaking this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum CloudMessageType {
    HttpInvoke,
    Ping,
    Pong,
    Other(u8),
}

impl From<CloudMessageType> for u8 {
    fn from(m: CloudMessageType) -> u8 {
        match m {
            CloudMessageType::HttpInvoke => 0x01,
            CloudMessageType::Ping => 0x10,
            CloudMessageType::Pong => 0x11,
            CloudMessageType::Other(v) => v,
        }
    }
}

impl From<u8> for CloudMessageType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => Self::HttpInvoke,
            0x10 => Self::Ping,
            0x11 => Self::Pong,
            other => Self::Other(other),
        }
    }
}

/// The envelope exchanged over a hub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudMessage {
    #[serde(rename = "type")]
    pub message_type: CloudMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_uid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl CloudMessage {
    /// An envelope with no content and no correlation id.
    pub fn new(message_type: CloudMessageType) -> Self {
        Self {
            message_type,
            correlation_uid: None,
            content: None,
        }
    }

    /// Convert the opaque content into the expected shape.
    pub fn content_as<T: DeserializeOwned>(&self) -> RelayResult<T> {
        let content = self.content.as_ref().ok_or_else(|| {
            RelayError::Deserialization(format!("{:?} message has no content", self.message_type))
        })?;
        Ok(content.deserialized()?)
    }

    /// Whether this envelope answers the request with the given correlation id.
    pub fn correlates_with(&self, correlation_uid: &Uuid) -> bool {
        self.correlation_uid.as_ref() == Some(correlation_uid)
    }
}

/// Stamps a type tag onto arbitrary serializable content.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloudMessageFactory;

impl CloudMessageFactory {
    pub fn new() -> Self {
        Self
    }

    /// Build an envelope of `message_type` carrying `content`.
    ///
    /// The correlation id is left unset; the connector assigns it on invoke.
    pub fn create_message<T: Serialize>(
        &self,
        message_type: CloudMessageType,
        content: &T,
    ) -> RelayResult<CloudMessage> {
        let content =
            Value::serialized(content).map_err(|e| RelayError::Codec(e.to_string()))?;
        Ok(CloudMessage {
            message_type,
            correlation_uid: None,
            content: Some(content),
        })
    }

    /// Build a reply to `request`, carrying over its correlation id.
    pub fn create_reply<T: Serialize>(
        &self,
        request: &CloudMessage,
        content: &T,
    ) -> RelayResult<CloudMessage> {
        let mut reply = self.create_message(request.message_type, content)?;
        reply.correlation_uid = request.correlation_uid;
        Ok(reply)
    }
}

/// A tunneled HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpRequestMessageContent {
    pub method: String,
    /// Path plus query string.
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl HttpRequestMessageContent {
    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A tunneled HTTP response. Header names may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpResponseMessageContent {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl HttpResponseMessageContent {
    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
