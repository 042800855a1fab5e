//! Per-handle packet reader.
//!
//! libpcap reads are blocking, so each handle gets a dedicated OS thread
//! (the same split the live-capture engine has always used). The thread
//! serializes kept packets as pcap records and feeds the async pipeline
//! through the bounded gather queue, dropping on a full queue rather than
//! stalling the kernel ring buffer.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use pcap::{Active, Capture};
use ps_config::SamplingRateConfig;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::records;

/// Read timeout for a live handle, in milliseconds.
pub const PKT_CAPTURE_TIMEOUT_MS: i32 = 5_000;

/// Consecutive non-timeout read errors after which a reader gives up on
/// its handle.
const MAX_READ_ERRORS: u32 = 10;

/// Keeps the first `max_pkts_to_write` packets of every
/// `max_total_pkts`-sized window. The 1/1 default keeps everything.
pub(crate) struct Sampler {
    keep: usize,
    window: usize,
    idx: usize,
}

impl Sampler {
    pub(crate) fn new(rate: SamplingRateConfig) -> Self {
        Self {
            keep: rate.max_pkts_to_write,
            window: rate.max_total_pkts.max(1),
            idx: 0,
        }
    }

    pub(crate) fn keep_next(&mut self) -> bool {
        let keep = self.idx < self.keep;
        self.idx = (self.idx + 1) % self.window;
        keep
    }
}

/// Spawn the reader thread for one capture handle.
///
/// The thread exits when the stop token is cancelled, when the gather
/// queue is closed, or after [`MAX_READ_ERRORS`] consecutive read errors.
/// Read timeouts are routine on an idle interface and are never counted.
pub fn spawn_reader(
    name: String,
    handle: Arc<Mutex<Capture<Active>>>,
    sampling: SamplingRateConfig,
    gather_tx: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    thread::spawn(move || read_loop(&name, &handle, sampling, &gather_tx, &stop))
}

fn read_loop(
    name: &str,
    handle: &Arc<Mutex<Capture<Active>>>,
    sampling: SamplingRateConfig,
    gather_tx: &mpsc::Sender<Vec<u8>>,
    stop: &CancellationToken,
) {
    let mut sampler = Sampler::new(sampling);
    let mut err_cnt = 0u32;

    loop {
        if stop.is_cancelled() {
            break;
        }
        if err_cnt == MAX_READ_ERRORS {
            log::error!("Maximum packet read error count reached on {}. Exiting", name);
            break;
        }

        let record = {
            let mut capture = match handle.lock() {
                Ok(capture) => capture,
                Err(_) => {
                    log::error!("Capture handle lock poisoned on {}. Exiting", name);
                    break;
                }
            };
            match capture.next_packet() {
                Ok(packet) => {
                    if !sampler.keep_next() {
                        continue;
                    }
                    err_cnt = 0;
                    records::record_bytes(
                        packet.header.ts.tv_sec as u32,
                        packet.header.ts.tv_usec as u32,
                        packet.header.len,
                        packet.data,
                    )
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    log::error!("Error while reading packets on {}: {}", name, e);
                    err_cnt += 1;
                    continue;
                }
            }
        };

        match gather_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::warn!("Gather queue is full. Discarding"),
            Err(TrySendError::Closed(_)) => break,
        }
    }

    log::debug!("Packet reader stopped on {}", name);
}
