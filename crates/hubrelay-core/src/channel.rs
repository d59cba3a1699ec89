//! Envelope framing over one physical hub connection.
//!
//! A [`Channel`] is split into a [`ChannelSender`] and a [`ChannelReceiver`]
//! so that the receive loop and concurrent writers never contend for the
//! same half. The channel itself does not serialize writers; callers must
//! hold an exclusive lock around [`ChannelSender::send`].

use crate::codec::{cbor_decode, frame_encode, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{RelayError, RelayResult};
use crate::messages::CloudMessage;
use crate::transport::{ByteSink, ByteSource, IoSink, IoSource};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// A framed, bidirectional envelope channel.
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub fn new(source: Box<dyn ByteSource>, sink: Box<dyn ByteSink>) -> Self {
        Self::with_max_frame_size(source, sink, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            sender: ChannelSender { sink, closed: false },
            receiver: ChannelReceiver {
                source,
                decoder: FrameDecoder::with_max_frame_size(max_frame_size),
                read_buf: vec![0u8; READ_CHUNK],
            },
        }
    }

    /// Build a channel over tokio reader/writer halves.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            Box::new(IoSource::new(reader)),
            Box::new(IoSink::new(writer)),
        )
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half: encodes envelopes into frames.
pub struct ChannelSender {
    sink: Box<dyn ByteSink>,
    closed: bool,
}

impl ChannelSender {
    /// Encode and write one envelope.
    pub async fn send(&mut self, message: &CloudMessage) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::ChannelClosed);
        }
        let frame = frame_encode(message)?;
        self.sink.write_all(&frame).await
    }

    /// Close the write side. Idempotent and infallible.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "channel close failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Read half: reassembles frames and decodes envelopes.
pub struct ChannelReceiver {
    source: Box<dyn ByteSource>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl ChannelReceiver {
    /// Wait for the next complete envelope.
    ///
    /// Returns [`RelayError::ChannelClosed`] on a clean end of stream and
    /// [`RelayError::Deserialization`] when a well-framed payload is not a
    /// valid envelope; the stream stays usable after the latter.
    pub async fn receive(&mut self) -> RelayResult<CloudMessage> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return cbor_decode(&frame);
            }

            let n = self.source.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.decoder.pending() > 0 {
                    return Err(RelayError::Transport(format!(
                        "connection closed mid-frame ({} bytes pending)",
                        self.decoder.pending()
                    )));
                }
                return Err(RelayError::ChannelClosed);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}
