//! Downstream-server sink.
//!
//! A receiver can relay the reconstructed stream to another receiver. The
//! sink is a client-side framed writer with the full retry-and-reconnect
//! policy; relayed records travel as uncompressed frames.

use std::sync::Arc;

use ps_config::Config;

use crate::writer::{FramedWriter, ServerConnector};
use crate::{frame, StreamError};

pub struct ServerSink {
    writer: FramedWriter<ServerConnector>,
}

impl ServerSink {
    pub async fn connect(config: Arc<Config>) -> Result<Self, StreamError> {
        let max_payload_len = frame::max_encoded_len(config.max_gather_len());
        let writer =
            FramedWriter::connect(ServerConnector::new(config), max_payload_len).await?;
        Ok(Self { writer })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write_frame(data, false).await
    }

    pub async fn flush_and_close(&mut self) -> Result<(), StreamError> {
        self.writer.shutdown().await;
        Ok(())
    }
}
