//! Producers and consumers attached to a Stream

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::error::SshError;

/// Default read size for socket/file producers
const PRODUCER_CHUNK: usize = 32 * 1024;

/// Receives output from a Stream side
#[async_trait]
pub trait Consumer: Send {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError>;

    /// Called once after the side reached EOF.
    async fn finish(&mut self) -> Result<(), SshError> {
        Ok(())
    }
}

/// Feeds a Stream's stdin
#[async_trait]
pub trait Producer: Send {
    /// Next chunk, or `None` once exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SshError>;
}

/// Consumer over any tokio writer (socket half, file, duplex end)
pub struct AsyncWriteConsumer<W> {
    writer: W,
    shutdown_on_finish: bool,
}

impl<W> AsyncWriteConsumer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            shutdown_on_finish: true,
        }
    }

    /// Keep the writer open after EOF (e.g. a shared stdout)
    pub fn keep_open(mut self) -> Self {
        self.shutdown_on_finish = false;
        self
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Consumer for AsyncWriteConsumer<W> {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError> {
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SshError> {
        if self.shutdown_on_finish {
            self.writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Producer over any tokio reader
pub struct AsyncReadProducer<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> AsyncReadProducer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: PRODUCER_CHUNK,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Producer for AsyncReadProducer<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SshError> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let n = self.reader.read_buf(&mut buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

/// Producer over a fixed list of chunks
#[derive(Debug, Default)]
pub struct ChunksProducer {
    chunks: VecDeque<Bytes>,
}

impl ChunksProducer {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Producer for ChunksProducer {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SshError> {
        Ok(self.chunks.pop_front())
    }
}

/// Collects everything in memory
#[derive(Debug, Default)]
pub struct VecConsumer {
    pub data: Vec<u8>,
    pub finished: bool,
}

#[async_trait]
impl Consumer for VecConsumer {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError> {
        self.data.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SshError> {
        self.finished = true;
        Ok(())
    }
}

/// Forwards chunks to an mpsc receiver; the receiver sees the channel close at EOF.
pub struct ChannelConsumer {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl Consumer for ChannelConsumer {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError> {
        match &self.tx {
            Some(tx) => tx
                .send(data)
                .map_err(|_| SshError::ChannelError("output receiver dropped".into())),
            None => Err(SshError::ChannelError("consumer already finished".into())),
        }
    }

    async fn finish(&mut self) -> Result<(), SshError> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_async_read_producer_until_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"hello world").await.unwrap();
        drop(client);

        let mut producer = AsyncReadProducer::new(server);
        let mut collected = Vec::new();
        while let Some(chunk) = producer.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn test_async_write_consumer_shuts_down() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut consumer = AsyncWriteConsumer::new(client);
        consumer.write(Bytes::from_static(b"abc")).await.unwrap();
        consumer.finish().await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_channel_consumer_closes_on_finish() {
        let (mut consumer, mut rx) = ChannelConsumer::new();
        consumer.write(Bytes::from_static(b"x")).await.unwrap();
        consumer.finish().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(rx.recv().await.is_none());
        assert!(consumer.write(Bytes::from_static(b"y")).await.is_err());
    }
}
