// src/connection/subscription.rs

//! A live pub/sub subscription: a dedicated connection switched into
//! subscriber mode, yielding messages as they are published.

use crate::core::StoreError;
use crate::core::errors::StoreResult;
use crate::core::protocol::{WireCodec, WireFrame};
use crate::connection::conn::{Conn, StoreStream};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::debug;

/// One message delivered to a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// A subscription object bound to its own (non-pooled) connection.
///
/// Subscribe/unsubscribe acknowledgement frames from the store are consumed
/// transparently; [`Subscription::next_message`] only yields actual
/// published messages.
pub struct Subscription {
    read: FramedRead<ReadHalf<StoreStream>, WireCodec>,
    write: WriteHalf<StoreStream>,
    write_codec: WireCodec,
    write_buf: BytesMut,
}

impl Subscription {
    pub(crate) fn new(conn: Conn) -> Self {
        let (stream, leftover) = conn.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read = FramedRead::new(read_half, WireCodec);
        // Bytes already received but not yet decoded stay in the frame buffer.
        read.read_buffer_mut().unsplit(leftover);
        Subscription {
            read,
            write: write_half,
            write_codec: WireCodec,
            write_buf: BytesMut::with_capacity(128),
        }
    }

    /// Adds a channel to this subscription.
    pub async fn subscribe(&mut self, channel: &str) -> StoreResult<()> {
        if channel.is_empty() {
            return Err(StoreError::InvalidArgument(
                "channel must be non-empty".to_string(),
            ));
        }
        debug!(channel, "subscribing");
        self.send(&[
            Bytes::from_static(b"SUBSCRIBE"),
            Bytes::copy_from_slice(channel.as_bytes()),
        ])
        .await
    }

    /// Removes a channel from this subscription.
    pub async fn unsubscribe(&mut self, channel: &str) -> StoreResult<()> {
        if channel.is_empty() {
            return Err(StoreError::InvalidArgument(
                "channel must be non-empty".to_string(),
            ));
        }
        debug!(channel, "unsubscribing");
        self.send(&[
            Bytes::from_static(b"UNSUBSCRIBE"),
            Bytes::copy_from_slice(channel.as_bytes()),
        ])
        .await
    }

    /// Waits for the next published message. Returns `Ok(None)` when the
    /// connection is closed by the peer. Cancel-safe: dropping the future
    /// between frames loses nothing.
    pub async fn next_message(&mut self) -> StoreResult<Option<Message>> {
        while let Some(frame) = self.read.next().await {
            if let Some(message) = interpret_push(frame?)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn send(&mut self, parts: &[Bytes]) -> StoreResult<()> {
        self.write_buf.clear();
        self.write_codec
            .encode(WireFrame::command(parts.to_vec()), &mut self.write_buf)?;
        self.write.write_all(&self.write_buf).await?;
        Ok(())
    }
}

/// Maps a pushed frame onto a message, swallowing subscription
/// acknowledgements and surfacing anything else as a protocol error.
fn interpret_push(frame: WireFrame) -> StoreResult<Option<Message>> {
    let items = match frame {
        WireFrame::Array(Some(items)) => items,
        WireFrame::Error(msg) => return Err(StoreError::Server(msg)),
        other => {
            return Err(StoreError::UnexpectedReply {
                command: "SUBSCRIBE",
                reply: other.describe(),
            });
        }
    };

    let kind = match items.first() {
        Some(WireFrame::Bulk(Some(kind))) => kind.clone(),
        _ => {
            return Err(StoreError::Protocol(
                "push frame missing kind element".to_string(),
            ));
        }
    };

    match kind.as_ref() {
        b"message" => match (items.get(1), items.get(2)) {
            (Some(WireFrame::Bulk(Some(channel))), Some(WireFrame::Bulk(Some(payload)))) => {
                Ok(Some(Message {
                    channel: String::from_utf8_lossy(channel).to_string(),
                    payload: String::from_utf8_lossy(payload).to_string(),
                }))
            }
            _ => Err(StoreError::Protocol(
                "malformed message push frame".to_string(),
            )),
        },
        // Acknowledgements carry the channel and the subscription count.
        b"subscribe" | b"unsubscribe" => Ok(None),
        other => Err(StoreError::Protocol(format!(
            "unexpected push frame kind '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}
