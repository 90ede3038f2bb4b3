use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::Error;

/// Receiving direction of a transport.
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Read some bytes and append them to `buf`. Returns the number of bytes
    /// read; 0 signals end of stream.
    async fn read_some(&mut self, buf: &mut BytesMut) -> std::io::Result<usize>;
}

/// Sending direction of a transport. The handler serialises access, so one
/// frame is written at a time.
#[async_trait]
pub trait TransportWriter: Send + 'static {
    /// Write one complete frame.
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
    /// Shut down the sending direction.
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl<T> TransportReader for T
where
    T: AsyncRead + Unpin + Send + 'static,
{
    async fn read_some(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        self.read_buf(buf).await
    }
}

#[async_trait]
impl<T> TransportWriter for T
where
    T: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.write_all(frame).await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

/// A connected byte stream that can be split into independent read and
/// write directions. The protocol engine only ever talks to this seam; the
/// concrete socket lives outside the core.
pub trait Transport: Send + 'static {
    /// Reader half moved into the receive loop task.
    type Reader: TransportReader;
    /// Writer half kept behind the send lock.
    type Writer: TransportWriter;

    /// Split into the two directions.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

impl Transport for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        TcpStream::into_split(self)
    }
}

/// Adapter making any duplex byte stream usable as a [`Transport`], e.g. an
/// in-memory [`tokio::io::DuplexStream`] wired to a scripted peer.
#[derive(Debug)]
pub struct StreamTransport<T>(
    /// The wrapped byte stream.
    pub T,
);

impl<T> Transport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = ReadHalf<T>;
    type Writer = WriteHalf<T>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.0)
    }
}

/// Open the TCP connection to the PLC within `connect_timeout`.
pub(crate) async fn dial(
    address: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, Error> {
    match timeout(connect_timeout, TcpStream::connect((address, port))).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(Error::Timeout { pdu_ref: None }),
    }
}
