//! Gather stage: concatenates pcap records into fixed-size batches.
//!
//! A batch is emitted when the next record would overflow it, when the
//! gather wait elapses with data pending, or when the stage drains on
//! shutdown. Batches go to the compress queue and, uncompressed, to the
//! plugin fan-out.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::stats::Stats;

pub async fn gather_stage(
    max_gather_len: usize,
    max_wait: Duration,
    mut input: mpsc::Receiver<Vec<u8>>,
    output: Option<mpsc::Sender<Vec<u8>>>,
    plugins: Option<mpsc::Sender<Vec<u8>>>,
    stats: Arc<Stats>,
    stop: CancellationToken,
) {
    let mut batch: Vec<u8> = Vec::with_capacity(max_gather_len);
    let mut ticker = tokio::time::interval(max_wait);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => flush(&mut batch, &output, &plugins),
            record = input.recv() => match record {
                Some(record) => {
                    stats.pkts_read.fetch_add(1, Ordering::Relaxed);
                    if batch.len() + record.len() > max_gather_len {
                        flush(&mut batch, &output, &plugins);
                    }
                    batch.extend_from_slice(&record);
                }
                None => break,
            },
        }
    }

    flush(&mut batch, &output, &plugins);
}

fn flush(
    batch: &mut Vec<u8>,
    output: &Option<mpsc::Sender<Vec<u8>>>,
    plugins: &Option<mpsc::Sender<Vec<u8>>>,
) {
    if batch.is_empty() {
        return;
    }
    let data = batch.clone();
    batch.clear();

    if let Some(plugins) = plugins {
        if let Err(TrySendError::Full(_)) = plugins.try_send(data.clone()) {
            log::warn!("Plugin queue is full. Discarding");
        }
    }
    if let Some(output) = output {
        if let Err(TrySendError::Full(_)) = output.try_send(data) {
            log::warn!("Gather output queue is full. Discarding");
        }
    }
}
