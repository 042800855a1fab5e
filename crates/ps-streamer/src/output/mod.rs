//! Terminal sinks for reconstructed packet data.
//!
//! A receiver can drive several sinks at once; a sink that fails fatally is
//! abandoned while the others keep going. Every sink gets an explicit
//! flush-and-close on shutdown.

mod file;
mod server;

pub use file::{FileSink, PacketBufWriter};
pub use server::ServerSink;

use std::sync::Arc;

use ps_config::Config;
use ps_capture::records;

use crate::StreamError;

pub enum Output {
    File(FileSink),
    Server(ServerSink),
}

impl Output {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        match self {
            Output::File(sink) => sink.write_record(data).await,
            Output::Server(sink) => sink.write_all(data).await,
        }
    }

    async fn flush_and_close(&mut self) -> Result<(), StreamError> {
        match self {
            Output::File(sink) => sink.flush_and_close().await,
            Output::Server(sink) => sink.flush_and_close().await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Output::File(_) => "file",
            Output::Server(_) => "server",
        }
    }
}

/// The set of configured non-plugin sinks.
pub struct Outputs {
    sinks: Vec<Output>,
    had_sinks: bool,
}

impl Outputs {
    /// Open every configured sink. File and downstream-server sinks may be
    /// active at the same time.
    pub async fn new(config: &Arc<Config>) -> Result<Self, StreamError> {
        let mut sinks = Vec::new();

        if let Some(file) = &config.output.file {
            let header = records::file_header(config.input_packet_len as u32);
            let capacity = config.max_gather_len() + header.len();
            sinks.push(Output::File(
                FileSink::create(&file.path, header, capacity).await?,
            ));
        }
        if config.output.server.is_some() {
            sinks.push(Output::Server(ServerSink::connect(Arc::clone(config)).await?));
        }

        let had_sinks = !sinks.is_empty();
        Ok(Self { sinks, had_sinks })
    }

    /// Write `data` to every remaining sink, dropping sinks that fail.
    ///
    /// Errors only once every sink is gone; a receiver that still feeds
    /// plugins starts with no sinks at all, which is not an error.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let mut failed = Vec::new();
        for (idx, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.write_all(data).await {
                log::error!("Abandoning {} sink: {}", sink.kind(), e);
                failed.push(idx);
            }
        }
        for idx in failed.into_iter().rev() {
            self.sinks.remove(idx);
        }
        if self.had_sinks && self.sinks.is_empty() {
            return Err(StreamError::AllSinksFailed);
        }
        Ok(())
    }

    pub async fn flush_and_close(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush_and_close().await {
                log::error!("Could not close {} sink: {}", sink.kind(), e);
            }
        }
        self.sinks.clear();
    }
}
