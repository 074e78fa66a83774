//! Framed byte-stream transport.
//!
//! Works over anything that is `AsyncRead + AsyncWrite`: accepted TCP
//! sockets, in-memory duplex pipes, child process stdio. The stream is split
//! so one read and one write can be in flight at once; each half owns its own
//! [`FramingProtocol`], which keeps the one-send/one-receive rule of the
//! protocol true by construction.

use super::base::BaseChannel;
use super::Transport;
use crate::config::{ChannelConfig, ProtocolConfig};
use crate::error::{Result, RpcError};
use crate::packet::Packet;
use crate::protocol::FramingProtocol;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Connector<S> = Box<dyn Fn() -> BoxFuture<'static, std::io::Result<S>> + Send + Sync>;

struct FrameReader<S> {
    half: ReadHalf<S>,
    protocol: FramingProtocol,
}

struct FrameWriter<S> {
    half: WriteHalf<S>,
    protocol: FramingProtocol,
}

impl<S> FrameReader<S> {
    fn new(half: ReadHalf<S>, max_packet_size: usize) -> Self {
        Self {
            half,
            protocol: FramingProtocol::with_max_packet_size(max_packet_size),
        }
    }
}

impl<S> FrameWriter<S> {
    fn new(half: WriteHalf<S>, max_packet_size: usize) -> Self {
        Self {
            half,
            protocol: FramingProtocol::with_max_packet_size(max_packet_size),
        }
    }
}

pub struct StreamTransport<S> {
    reader: Mutex<Option<FrameReader<S>>>,
    writer: Mutex<Option<FrameWriter<S>>>,
    connector: Option<Connector<S>>,
    max_packet_size: usize,
}

/// A [`BaseChannel`] over a framed byte stream.
pub type StreamChannel<S> = BaseChannel<StreamTransport<S>>;

pub type TcpChannel = StreamChannel<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Transport over a stream that is already connected.
    pub fn from_stream(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        let max = ProtocolConfig::MAX_PACKET_SIZE;
        Self {
            reader: Mutex::new(Some(FrameReader::new(read, max))),
            writer: Mutex::new(Some(FrameWriter::new(write, max))),
            connector: None,
            max_packet_size: max,
        }
    }

    /// Transport that establishes its stream on `connect`.
    pub fn with_connector<F, Fut>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<S>> + Send + 'static,
    {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connector: Some(Box::new(move || Box::pin(connect()))),
            max_packet_size: ProtocolConfig::MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        if let Some(reader) = self.reader.get_mut() {
            reader.protocol = FramingProtocol::with_max_packet_size(max_packet_size);
        }
        if let Some(writer) = self.writer.get_mut() {
            writer.protocol = FramingProtocol::with_max_packet_size(max_packet_size);
        }
        self
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn connect(&self, ct: &CancellationToken) -> Result<()> {
        if self.writer.lock().await.is_some() {
            return Ok(());
        }
        let Some(connector) = self.connector.as_ref() else {
            return Err(RpcError::transport("stream transport has no stream"));
        };

        let stream = tokio::select! {
            result = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, connector()) => {
                result.map_err(|_| RpcError::transport("connect timed out"))??
            }
            _ = ct.cancelled() => return Err(RpcError::Cancelled),
        };

        let (read, write) = tokio::io::split(stream);
        *self.reader.lock().await = Some(FrameReader::new(read, self.max_packet_size));
        *self.writer.lock().await = Some(FrameWriter::new(write, self.max_packet_size));
        debug!("Stream transport connected");
        Ok(())
    }

    async fn disconnect(&self, _ct: &CancellationToken) -> Result<()> {
        // The read half is left to the receive loop, which sees EOF once the
        // peer answers the shutdown.
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.half.shutdown().await?;
        }
        Ok(())
    }

    async fn write_packet(&self, packet: &Packet, ct: &CancellationToken) -> Result<()> {
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = ct.cancelled() => return Err(RpcError::Cancelled),
        };
        let writer = guard.as_mut().ok_or(RpcError::ConnectionClosed)?;

        writer.protocol.start_sending(packet.data.clone())?;
        let outcome = tokio::select! {
            result = write_frame(writer) => result,
            _ = ct.cancelled() => Err(RpcError::transport("send cancelled mid-frame")),
        };
        writer.protocol.end_sending();
        outcome
    }

    async fn read_packet(&self, ct: &CancellationToken) -> Result<Packet> {
        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = ct.cancelled() => return Err(RpcError::Cancelled),
        };
        let reader = guard.as_mut().ok_or(RpcError::ConnectionClosed)?;

        let mut consumed = 0usize;
        let outcome = tokio::select! {
            result = read_frame(reader, &mut consumed) => result,
            _ = ct.cancelled() => Err(RpcError::Cancelled),
        };
        if reader.protocol.is_receiving() {
            let _ = reader.protocol.end_receiving();
        }

        match outcome {
            // Abandoning a frame part-way leaves the stream unsynchronized.
            Err(RpcError::Cancelled) if consumed > 0 => {
                Err(RpcError::transport("receive cancelled mid-frame"))
            }
            other => other,
        }
    }
}

async fn write_frame<S: AsyncWrite>(writer: &mut FrameWriter<S>) -> Result<()> {
    while let Some(block) = writer.protocol.get_next_block_to_send() {
        writer.half.write_all(&block).await?;
    }
    writer.half.flush().await?;
    Ok(())
}

async fn read_frame<S: AsyncRead>(reader: &mut FrameReader<S>, consumed: &mut usize) -> Result<Packet> {
    let mut want = reader.protocol.start_receiving();
    while want > 0 {
        let block = read_block(&mut reader.half, want, consumed).await?;
        if *consumed == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        want = reader.protocol.apply_next_received_block(&block);
    }
    let body = reader.protocol.end_receiving()?;
    Ok(Packet::new(body))
}

/// Read up to `want` bytes, stopping short only at end of stream.
async fn read_block<R: AsyncRead + Unpin>(
    reader: &mut R,
    want: usize,
    consumed: &mut usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        *consumed += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

impl<S> BaseChannel<StreamTransport<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Channel over an already-connected stream; `open` completes immediately.
    pub fn from_stream(stream: S) -> Self {
        BaseChannel::new(StreamTransport::from_stream(stream))
    }
}

impl BaseChannel<StreamTransport<TcpStream>> {
    /// Channel that dials `addr` when opened.
    pub fn connect_tcp(addr: impl Into<String>) -> Self {
        let addr: String = addr.into();
        BaseChannel::new(StreamTransport::with_connector(move || {
            let addr = addr.clone();
            async move {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        }))
    }
}
