// src/connection/conn.rs

//! A single connection to the store: TCP (optionally wrapped in TLS), the
//! wire codec, and one-command-at-a-time round-trips with socket timeouts.

use crate::config::ConnectionDescriptor;
use crate::core::StoreError;
use crate::core::errors::StoreResult;
use crate::core::protocol::{WireCodec, WireFrame};
use bytes::{Bytes, BytesMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Transport abstraction over plain TCP and TLS, so the command logic is
/// generic over the transport layer.
pub(crate) enum StoreStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for StoreStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StoreStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            StoreStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StoreStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            StoreStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            StoreStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            StoreStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            StoreStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            StoreStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            StoreStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One established, authenticated connection with reusable buffers.
pub(crate) struct Conn {
    stream: StoreStream,
    codec: WireCodec,
    write_buf: BytesMut,
    read_buf: BytesMut,
    socket_timeout: Duration,
    last_used: Instant,
}

impl Conn {
    /// Dials the store, performs the optional TLS handshake, and runs the
    /// `AUTH` / `SELECT` handshake dictated by the descriptor.
    pub(crate) async fn open(desc: &ConnectionDescriptor) -> StoreResult<Self> {
        let connect = TcpStream::connect((desc.host.as_str(), desc.port));
        let tcp = tokio::time::timeout(desc.connect_timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout(desc.connect_timeout))??;
        tcp.set_nodelay(true)?;

        let stream = if desc.use_tls {
            debug!(host = %desc.host, "establishing TLS connection to store");
            let mut root_cert_store = rustls::RootCertStore::empty();
            root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));

            let domain = rustls::pki_types::ServerName::try_from(desc.host.as_str())
                .map_err(|_| {
                    StoreError::Config(format!("'{}' is not a valid TLS server name", desc.host))
                })?
                .to_owned();

            let handshake = connector.connect(domain, tcp);
            let tls_stream = tokio::time::timeout(desc.connect_timeout, handshake)
                .await
                .map_err(|_| StoreError::Timeout(desc.connect_timeout))??;
            StoreStream::Tls(Box::new(tls_stream))
        } else {
            StoreStream::Tcp(tcp)
        };

        let mut conn = Conn {
            stream,
            codec: WireCodec,
            write_buf: BytesMut::with_capacity(256),
            read_buf: BytesMut::with_capacity(4096),
            socket_timeout: desc.socket_timeout,
            last_used: Instant::now(),
        };

        if let Some(password) = &desc.password {
            conn.expect_ok("AUTH", &[
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(password.as_bytes()),
            ])
            .await?;
        }
        if desc.db_index > 0 {
            conn.expect_ok("SELECT", &[
                Bytes::from_static(b"SELECT"),
                Bytes::from(desc.db_index.to_string()),
            ])
            .await?;
        }

        Ok(conn)
    }

    /// Sends one command and reads exactly one reply frame. Error replies
    /// from the store are returned as frames; timeouts and IO failures as
    /// errors.
    pub(crate) async fn command(&mut self, parts: &[Bytes]) -> StoreResult<WireFrame> {
        self.write_buf.clear();
        self.codec
            .encode(WireFrame::command(parts.to_vec()), &mut self.write_buf)?;

        let write = self.stream.write_all(&self.write_buf);
        tokio::time::timeout(self.socket_timeout, write)
            .await
            .map_err(|_| StoreError::Timeout(self.socket_timeout))??;

        loop {
            if let Some(reply) = self.codec.decode(&mut self.read_buf)? {
                self.last_used = Instant::now();
                return Ok(reply);
            }
            let read = self.stream.read_buf(&mut self.read_buf);
            match tokio::time::timeout(self.socket_timeout, read).await {
                Ok(Ok(0)) => return Err(StoreError::ConnectionClosed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(StoreError::Timeout(self.socket_timeout)),
            }
        }
    }

    /// Liveness probe: a `PING` round-trip that must answer `PONG`.
    pub(crate) async fn ping(&mut self) -> StoreResult<()> {
        match self.command(&[Bytes::from_static(b"PING")]).await? {
            WireFrame::Simple(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
            WireFrame::Bulk(Some(b)) if b.eq_ignore_ascii_case(b"PONG") => Ok(()),
            WireFrame::Error(msg) => Err(StoreError::Server(msg)),
            other => Err(StoreError::UnexpectedReply {
                command: "PING",
                reply: other.describe(),
            }),
        }
    }

    /// How long this connection has sat unused.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Flushes and closes the underlying transport.
    pub(crate) async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Hands the transport (plus any buffered, undecoded bytes) to a
    /// consumer that takes over framing, e.g. a pub/sub subscription.
    pub(crate) fn into_parts(self) -> (StoreStream, BytesMut) {
        (self.stream, self.read_buf)
    }

    async fn expect_ok(&mut self, command: &'static str, parts: &[Bytes]) -> StoreResult<()> {
        match self.command(parts).await? {
            WireFrame::Simple(s) if s.eq_ignore_ascii_case("OK") => Ok(()),
            WireFrame::Error(msg) => Err(StoreError::Server(msg)),
            other => Err(StoreError::UnexpectedReply {
                command,
                reply: other.describe(),
            }),
        }
    }
}
