//! File sink.
//!
//! Writes buffered pcap data to a file or standard output. The buffer is
//! seeded with a pcap file header and re-seeded after every flush, so the
//! byte stream is a sequence of complete pcap files laid end to end; any
//! flush boundary is a valid place to cut the stream.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::StreamError;

/// Buffered writer that flushes when the next write would not fit and
/// starts every buffer with the pcap file header.
pub struct PacketBufWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    buf: Vec<u8>,
    capacity: usize,
    header: Vec<u8>,
}

impl PacketBufWriter {
    pub fn new(inner: Box<dyn AsyncWrite + Send + Unpin>, capacity: usize, header: Vec<u8>) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.extend_from_slice(&header);
        Self {
            inner,
            buf,
            capacity,
            header,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush().await?;
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Write the buffer out and seed the next one with a fresh header.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        self.inner.write_all(&self.buf).await?;
        self.buf.clear();
        self.buf.extend_from_slice(&self.header);
        Ok(())
    }

    /// Flush pending data (skipping a trailing header-only buffer) and
    /// flush the underlying writer.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        if self.buf.len() > self.header.len() {
            self.inner.write_all(&self.buf).await?;
        }
        self.buf.clear();
        self.inner.flush().await?;
        Ok(())
    }
}

pub struct FileSink {
    writer: PacketBufWriter,
}

impl FileSink {
    /// Open the sink. The path `stdout` writes to standard output instead
    /// of a file.
    pub async fn create(path: &str, header: Vec<u8>, capacity: usize) -> Result<Self, StreamError> {
        let inner: Box<dyn AsyncWrite + Send + Unpin> = if path == "stdout" {
            Box::new(tokio::io::stdout())
        } else {
            Box::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(path)
                    .await?,
            )
        };
        Ok(Self {
            writer: PacketBufWriter::new(inner, capacity, header),
        })
    }

    pub async fn write_record(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    pub async fn flush_and_close(&mut self) -> Result<(), StreamError> {
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_every_flushed_chunk_starts_with_the_header() {
        let sink = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let header = b"HDR!".to_vec();
        // Capacity fits the header plus one 8-byte record.
        let mut writer = PacketBufWriter::new(Box::new(sink.clone()), 12, header.clone());

        writer.write(&[1u8; 8]).await.unwrap();
        writer.write(&[2u8; 8]).await.unwrap();
        writer.close().await.unwrap();

        let written = sink.0.lock().unwrap().clone();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"HDR!");
        expected.extend_from_slice(&[1u8; 8]);
        expected.extend_from_slice(b"HDR!");
        expected.extend_from_slice(&[2u8; 8]);
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_close_skips_a_header_only_buffer() {
        let sink = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let mut writer = PacketBufWriter::new(Box::new(sink.clone()), 12, b"HDR!".to_vec());

        writer.write(&[1u8; 8]).await.unwrap();
        writer.flush().await.unwrap();
        writer.close().await.unwrap();

        let written = sink.0.lock().unwrap().clone();
        assert_eq!(written.len(), 12);
        assert_eq!(&written[..4], b"HDR!");
    }

    #[tokio::test]
    async fn test_file_sink_writes_pcap_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let header = ps_capture::records::file_header(65535);

        let mut sink = FileSink::create(path.to_str().unwrap(), header.clone(), 1024)
            .await
            .unwrap();
        sink.write_record(&[0xaa; 32]).await.unwrap();
        sink.flush_and_close().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[..header.len()], header.as_slice());
        assert_eq!(&contents[header.len()..], &[0xaa; 32]);
    }
}
