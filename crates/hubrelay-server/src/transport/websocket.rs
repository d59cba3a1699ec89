//! Hub connections carried over WebSocket.
//!
//! The length-prefixed envelope stream is sent as a sequence of binary
//! WebSocket messages. Message boundaries carry no meaning: a large frame may
//! span several messages and one message may hold several frames, so the
//! receive side simply concatenates payloads into the frame decoder.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hubrelay_core::transport::{BoxFuture, ByteSink, ByteSource};
use hubrelay_core::{Channel, RelayError, RelayResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Largest binary message we emit (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Build an envelope channel over an established WebSocket.
pub fn channel_from_websocket<S>(ws: WebSocketStream<S>, max_frame_size: usize) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Channel::with_max_frame_size(
        Box::new(WsSource::new(stream)),
        Box::new(WsSink::new(sink)),
        max_frame_size,
    )
}

/// Read half: yields the bytes of binary messages in arrival order.
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> WsSource<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl<S> ByteSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, RelayResult<usize>> {
        Box::pin(async move {
            while self.offset >= self.pending.len() {
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        self.pending = data.into();
                        self.offset = 0;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "hub sent close frame");
                        return Ok(0);
                    }
                    // Pings are answered by tungstenite; text is not part of the protocol.
                    Some(Ok(_)) => continue,
                    Some(Err(tungstenite::Error::ConnectionClosed))
                    | Some(Err(tungstenite::Error::AlreadyClosed))
                    | None => return Ok(0),
                    Some(Err(e)) => {
                        return Err(RelayError::Transport(format!("WS recv failed: {e}")));
                    }
                }
            }

            let available = &self.pending[self.offset..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.offset += n;
            Ok(n)
        })
    }
}

/// Write half: splits writes into binary messages of at most 1 MiB.
pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsSink<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { sink }
    }
}

impl<S> ByteSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            for chunk in data.chunks(MAX_WS_FRAME_SIZE) {
                self.sink
                    .feed(Message::Binary(chunk.to_vec().into()))
                    .await
                    .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))?;
            }
            self.sink
                .flush()
                .await
                .map_err(|e| RelayError::Transport(format!("WS flush failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            self.sink
                .close()
                .await
                .map_err(|e| RelayError::Transport(format!("WS close failed: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrelay_core::{CloudMessage, CloudMessageFactory, CloudMessageType};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (
            channel_from_websocket(server, 64 * 1024 * 1024),
            channel_from_websocket(client, 64 * 1024 * 1024),
        )
    }

    #[tokio::test]
    async fn envelopes_cross_the_websocket() {
        let (server, client) = ws_pair().await;
        let (_server_tx, mut server_rx) = server.split();
        let (mut client_tx, _client_rx) = client.split();

        let factory = CloudMessageFactory::new();
        let first = factory
            .create_message(CloudMessageType::Ping, &"one")
            .unwrap();
        let second = CloudMessage::new(CloudMessageType::Pong);
        client_tx.send(&first).await.unwrap();
        client_tx.send(&second).await.unwrap();

        let got = server_rx.receive().await.unwrap();
        assert_eq!(got.message_type, CloudMessageType::Ping);
        assert_eq!(got.content_as::<String>().unwrap(), "one");
        let got = server_rx.receive().await.unwrap();
        assert_eq!(got.message_type, CloudMessageType::Pong);
    }

    #[tokio::test]
    async fn frames_larger_than_one_message_are_reassembled() {
        let (server, client) = ws_pair().await;
        let (_server_tx, mut server_rx) = server.split();
        let (mut client_tx, _client_rx) = client.split();

        let payload = serde_bytes::ByteBuf::from(vec![0xa5u8; 3 * MAX_WS_FRAME_SIZE + 17]);
        let message = CloudMessageFactory::new()
            .create_message(CloudMessageType::HttpInvoke, &payload)
            .unwrap();

        let send = tokio::spawn(async move { client_tx.send(&message).await });
        let got = server_rx.receive().await.unwrap();
        send.await.unwrap().unwrap();

        let body: serde_bytes::ByteBuf = got.content_as().unwrap();
        assert_eq!(body.len(), payload.len());
        assert!(body.iter().all(|b| *b == 0xa5));
    }

    #[tokio::test]
    async fn close_frame_ends_the_receiver() {
        let (server, client) = ws_pair().await;
        let (_server_tx, mut server_rx) = server.split();
        let (mut client_tx, _client_rx) = client.split();

        client_tx.close().await;
        assert!(matches!(
            server_rx.receive().await,
            Err(RelayError::ChannelClosed)
        ));
    }
}
