//! Sensor pipeline orchestration.
//!
//! capture readers → gather → compress → frame+write. Every stage hangs
//! off a bounded queue with drop-on-full semantics; the stop token unblocks
//! all of them. A fatal error in the writer or the interface manager
//! cancels the whole pipeline.

use std::sync::Arc;

use ps_config::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::compress;
use crate::frame::Block;
use crate::gather;
use crate::output::FileSink;
use crate::stats::{self, Stats};
use crate::writer::{FramedWriter, ServerConnector};
use crate::{frame, StreamError};

/// Queue in front of the gather stage; sized for a burst of raw records.
const GATHER_QUEUE_LEN: usize = 50_000;

/// Queue between any two later stages.
const STAGE_QUEUE_LEN: usize = 100;

/// Run the sensor until the stop token fires or the pipeline dies.
pub async fn run(
    config: Arc<Config>,
    plugin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stop: CancellationToken,
) -> Result<(), StreamError> {
    let stats = Arc::new(Stats::default());
    tokio::spawn(stats::packet_count_loop(
        Arc::clone(&stats),
        stop.child_token(),
    ));

    let (gather_tx, gather_rx) = mpsc::channel(GATHER_QUEUE_LEN);
    let max_gather_len = config.max_gather_len();

    let output_handle = if config.output.server.is_some() {
        let (batch_tx, batch_rx) = mpsc::channel(STAGE_QUEUE_LEN);
        let (frame_tx, frame_rx) = mpsc::channel(STAGE_QUEUE_LEN);
        tokio::spawn(gather::gather_stage(
            max_gather_len,
            config.max_gather_wait,
            gather_rx,
            Some(batch_tx),
            plugin_tx,
            Arc::clone(&stats),
            stop.child_token(),
        ));
        tokio::spawn(compress::compress_stage(
            max_gather_len,
            batch_rx,
            frame_tx,
            stop.child_token(),
        ));
        tokio::spawn(write_loop(Arc::clone(&config), frame_rx, stop.clone()))
    } else if let Some(file) = config.output.file.clone() {
        let (batch_tx, batch_rx) = mpsc::channel(STAGE_QUEUE_LEN);
        tokio::spawn(gather::gather_stage(
            max_gather_len,
            config.max_gather_wait,
            gather_rx,
            Some(batch_tx),
            plugin_tx,
            Arc::clone(&stats),
            stop.child_token(),
        ));
        tokio::spawn(file_loop(
            Arc::clone(&config),
            file.path,
            batch_rx,
            stop.clone(),
        ))
    } else {
        // Plugin-only sensor: gathered batches go to the fan-out alone.
        tokio::spawn(gather::gather_stage(
            max_gather_len,
            config.max_gather_wait,
            gather_rx,
            None,
            plugin_tx,
            Arc::clone(&stats),
            stop.child_token(),
        ));
        let wait = stop.clone();
        tokio::spawn(async move {
            wait.cancelled().await;
            Ok::<(), StreamError>(())
        })
    };

    let manager_stop = stop.clone();
    let manager_config = Arc::clone(&config);
    let manager_handle = tokio::spawn(async move {
        let result = ps_capture::manager::run(manager_config, gather_tx, manager_stop.clone()).await;
        if result.is_err() {
            manager_stop.cancel();
        }
        result
    });

    stop.cancelled().await;

    let manager_result = manager_handle.await;
    let output_result = output_handle.await;
    match manager_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(StreamError::Io(std::io::Error::other(e))),
    }
    match output_result {
        Ok(result) => result,
        Err(e) => Err(StreamError::Io(std::io::Error::other(e))),
    }
}

/// Drain compressed blocks into the framed transport. Cancels the pipeline
/// when the write budget is exhausted for good.
async fn write_loop(
    config: Arc<Config>,
    mut frames: mpsc::Receiver<Block>,
    stop: CancellationToken,
) -> Result<(), StreamError> {
    let max_payload_len = frame::max_encoded_len(config.max_gather_len());
    let connector = ServerConnector::new(Arc::clone(&config));
    let mut writer = match FramedWriter::connect(connector, max_payload_len).await {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("Failed to connect: {}", e);
            stop.cancel();
            return Err(e);
        }
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            block = frames.recv() => match block {
                Some(block) => {
                    if let Err(e) = writer.write_frame(&block.data, block.compressed).await {
                        log::error!("Giving up on the output connection: {}", e);
                        stop.cancel();
                        return Err(e);
                    }
                }
                None => break,
            },
        }
    }

    writer.shutdown().await;
    Ok(())
}

/// Write gathered batches straight to a local pcap file. Batches skip the
/// compression stage entirely so the file is plain pcap.
async fn file_loop(
    config: Arc<Config>,
    path: String,
    mut batches: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
) -> Result<(), StreamError> {
    let header = ps_capture::records::file_header(config.input_packet_len as u32);
    let capacity = config.max_gather_len() + header.len();
    let mut sink = match FileSink::create(&path, header, capacity).await {
        Ok(sink) => sink,
        Err(e) => {
            log::error!("Could not open the output file {}: {}", path, e);
            stop.cancel();
            return Err(e);
        }
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => {
                    if let Err(e) = sink.write_record(&batch).await {
                        log::error!("Giving up on the output file: {}", e);
                        stop.cancel();
                        return Err(e);
                    }
                }
                None => break,
            },
        }
    }

    sink.flush_and_close().await?;
    Ok(())
}
