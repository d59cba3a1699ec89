//! Transports that carry hub connections.

pub mod websocket;

pub use websocket::channel_from_websocket;
