//! Framed writer with the sensor's retry policy: ten write attempts, one
//! reconnect with full connection setup, ten more attempts, then the
//! pipeline is abandoned. Partial writes advance the offset and count as
//! attempts; a reconnect restarts the frame from the beginning.

use std::future::Future;
use std::sync::Arc;

use ps_config::Config;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::transport::{self, Transport};
use crate::{frame, StreamError};

pub const MAX_WRITE_ATTEMPTS: usize = 10;

/// Produces a fresh connection, including TLS and auth setup.
pub trait Connector: Send + Sync {
    type Conn: AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, StreamError>> + Send;
}

/// Connector for the configured downstream server.
pub struct ServerConnector {
    config: Arc<Config>,
}

impl ServerConnector {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Connector for ServerConnector {
    type Conn = Transport;

    fn connect(&self) -> impl Future<Output = Result<Transport, StreamError>> + Send {
        async move { transport::connect(&self.config).await }
    }
}

pub struct FramedWriter<C: Connector> {
    connector: C,
    conn: C::Conn,
    frame: Vec<u8>,
    max_payload_len: usize,
}

impl<C: Connector> FramedWriter<C> {
    pub async fn connect(connector: C, max_payload_len: usize) -> Result<Self, StreamError> {
        let conn = connector.connect().await?;
        Ok(Self {
            connector,
            conn,
            frame: Vec::with_capacity(frame::HEADER_LEN + max_payload_len),
            max_payload_len,
        })
    }

    /// Frame `payload` and write it with the retry policy.
    pub async fn write_frame(
        &mut self,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), StreamError> {
        frame::encode_into(&mut self.frame, payload, compressed, self.max_payload_len)?;
        self.write_with_retry().await
    }

    async fn write_with_retry(&mut self) -> Result<(), StreamError> {
        let mut attempts = 0;
        let mut reconnected = false;
        let mut written = 0;

        loop {
            if attempts == MAX_WRITE_ATTEMPTS {
                if !reconnected {
                    reconnected = true;
                    log::warn!("Tried to write {} times. Reconnecting once", attempts);
                    self.conn = self.connector.connect().await?;
                    attempts = 0;
                    written = 0;
                    continue;
                }
                log::error!("Tried to write {} times. Bailing out", attempts);
                return Err(StreamError::WriteBudgetExhausted(MAX_WRITE_ATTEMPTS));
            }

            match self.conn.write(&self.frame[written..]).await {
                Ok(n) if written + n == self.frame.len() => return Ok(()),
                Ok(n) => {
                    log::warn!(
                        "Not all bytes written to output. Wanted to write {}, but wrote only {}",
                        self.frame.len() - written,
                        n
                    );
                    written += n;
                    attempts += 1;
                }
                Err(e) => {
                    log::warn!("Error while writing data to output: {}", e);
                    attempts += 1;
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.conn.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// Writer that fails with a broken pipe while a shared failure budget
    /// remains, then accepts everything.
    struct FlakyWriter {
        failures: Arc<AtomicUsize>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
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

    struct FlakyConnector {
        failures: Arc<AtomicUsize>,
        written: Arc<Mutex<Vec<u8>>>,
        connects: Arc<AtomicUsize>,
    }

    impl Connector for FlakyConnector {
        type Conn = FlakyWriter;

        fn connect(&self) -> impl Future<Output = Result<FlakyWriter, StreamError>> + Send {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let conn = FlakyWriter {
                failures: Arc::clone(&self.failures),
                written: Arc::clone(&self.written),
            };
            async move { Ok(conn) }
        }
    }

    fn connector(failures: usize) -> (FlakyConnector, Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let written = Arc::new(Mutex::new(Vec::new()));
        let connector = FlakyConnector {
            failures: Arc::new(AtomicUsize::new(failures)),
            written: Arc::clone(&written),
            connects: Arc::clone(&connects),
        };
        (connector, connects, written)
    }

    #[tokio::test]
    async fn test_clean_write_needs_no_retry() {
        let (connector, connects, written) = connector(0);
        let mut writer = FramedWriter::connect(connector, 1024).await.unwrap();
        writer.write_frame(b"payload", false).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let written = written.lock().unwrap();
        assert_eq!(&written[..4], &frame::MAGIC);
        assert_eq!(&written[frame::HEADER_LEN..], b"payload");
    }

    #[tokio::test]
    async fn test_ten_failures_trigger_exactly_one_reconnect() {
        let (connector, connects, written) = connector(10);
        let mut writer = FramedWriter::connect(connector, 1024).await.unwrap();
        writer.write_frame(b"payload", false).await.unwrap();
        // Initial connect plus one reconnect, then the write lands.
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(&written.lock().unwrap()[frame::HEADER_LEN..], b"payload");
    }

    #[tokio::test]
    async fn test_twenty_failures_abandon_the_pipeline() {
        let (connector, connects, written) = connector(20);
        let mut writer = FramedWriter::connect(connector, 1024).await.unwrap();
        let err = writer.write_frame(b"payload", false).await.unwrap_err();
        assert!(matches!(err, StreamError::WriteBudgetExhausted(10)));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(written.lock().unwrap().is_empty());
    }
}
