//! hubrelay-core: Shared protocol library for hubrelay.
//!
//! Provides the cloud message envelope and its content shapes, the
//! length-prefixed CBOR codec, byte transport traits, envelope channels and
//! the authorization identity shared by hubs and HTTP callers.

pub mod channel;
pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use channel::{Channel, ChannelReceiver, ChannelSender};
pub use codec::{cbor_decode, frame_encode, FrameDecoder};
pub use error::{RelayError, RelayResult};
pub use identity::AuthorizationContext;
pub use messages::{
    CloudMessage, CloudMessageFactory, CloudMessageType, HttpRequestMessageContent,
    HttpResponseMessageContent,
};
