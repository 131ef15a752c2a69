//! Framed message streams over any async byte stream
//!
//! Both tunnel directions speak length-prefixed bincode frames; this module
//! wraps a raw stream (TLS, TCP, or an in-memory duplex in tests) into
//! message-granular send/recv halves.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::codec::{CodecError, FrameCodec};

const READ_CHUNK: usize = 16 * 1024;

/// Receiving half of a framed stream.
pub struct MessageSource<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageSource<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Receive the next frame.
    ///
    /// Returns Ok(None) on clean end-of-stream; a stream that ends in the
    /// middle of a frame is an error.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, CodecError> {
        loop {
            if let Some(msg) = FrameCodec::decode(&mut self.buf)? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::TruncatedFrame);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Sending half of a framed stream.
pub struct MessageSink<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin> MessageSink<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), CodecError> {
        let encoded = FrameCodec::encode(msg)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write side, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Split a bidirectional stream into framed halves.
pub fn split_stream<S>(io: S) -> (MessageSource<ReadHalf<S>>, MessageSink<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(io);
    (MessageSource::new(r), MessageSink::new(w))
}

/// A framed stream used sequentially from one task (the cmdtool, tests).
pub struct MessageStream<S> {
    io: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), CodecError> {
        let encoded = FrameCodec::encode(msg)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, CodecError> {
        loop {
            if let Some(msg) = FrameCodec::decode(&mut self.buf)? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::TruncatedFrame);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
