//! Compression stages.
//!
//! Batches are block-compressed with the Snappy raw format. A block that
//! would expand is forwarded as-is with the compressed flag cleared, so the
//! receiver always knows which decoding path to take. Both stages drop on
//! a full downstream queue instead of blocking the pipeline.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::frame::Block;

/// Encode gathered batches from `input` into [`Block`]s on `output`.
pub async fn compress_stage(
    max_plain_len: usize,
    mut input: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Block>,
    stop: CancellationToken,
) {
    let mut encoder = snap::raw::Encoder::new();
    let mut out_buf = vec![0u8; snap::raw::max_compress_len(max_plain_len)];

    loop {
        let data = tokio::select! {
            _ = stop.cancelled() => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let needed = snap::raw::max_compress_len(data.len());
        if needed > out_buf.len() {
            out_buf.resize(needed, 0);
        }

        let block = match encoder.compress(&data, &mut out_buf) {
            Ok(n) if n > data.len() => Block {
                data,
                compressed: false,
            },
            Ok(n) => Block {
                data: out_buf[..n].to_vec(),
                compressed: true,
            },
            Err(e) => {
                log::error!("Error while compressing batch: {}", e);
                continue;
            }
        };

        match output.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Compression output queue is full. Discarding");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Decode received [`Block`]s from `input` into raw batches on `output`.
///
/// An undecodable block is dropped and the stage continues; corruption on
/// one frame does not take the connection down.
pub async fn decompress_stage(
    mut input: mpsc::Receiver<Block>,
    output: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
) {
    let mut decoder = snap::raw::Decoder::new();

    loop {
        let block = tokio::select! {
            _ = stop.cancelled() => break,
            block = input.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };

        let data = if block.compressed {
            match decoder.decompress_vec(&block.data) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Error while decompressing frame: {}", e);
                    continue;
                }
            }
        } else {
            block.data
        };

        match output.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Decompression output queue is full. Discarding");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 65 * 1024;

    async fn compress_one(data: Vec<u8>) -> Block {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        in_tx.send(data).await.unwrap();
        drop(in_tx);
        compress_stage(BLOCK, in_rx, out_tx, CancellationToken::new()).await;
        out_rx.recv().await.unwrap()
    }

    async fn decompress_one(block: Block) -> Vec<u8> {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        in_tx.send(block).await.unwrap();
        drop(in_tx);
        decompress_stage(in_rx, out_tx, CancellationToken::new()).await;
        out_rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_compressible_batch_round_trips() {
        let data = vec![0u8; 4096];
        let block = compress_one(data.clone()).await;
        assert!(block.compressed);
        assert!(block.data.len() < data.len());
        assert_eq!(decompress_one(block).await, data);
    }

    #[tokio::test]
    async fn test_expanding_batch_is_passed_through() {
        // Pseudo-random bytes do not compress; the stage must fall back to
        // the uncompressed variant rather than ship a larger block.
        let mut state = 0x2545f491_4f6cdd1du64;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let block = compress_one(data.clone()).await;
        assert!(!block.compressed);
        assert_eq!(block.data, data);
        assert_eq!(decompress_one(block).await, data);
    }

    #[tokio::test]
    async fn test_corrupt_block_is_dropped() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        in_tx
            .send(Block {
                data: vec![0xff, 0xff, 0xff, 0xff],
                compressed: true,
            })
            .await
            .unwrap();
        in_tx
            .send(Block {
                data: b"survivor".to_vec(),
                compressed: false,
            })
            .await
            .unwrap();
        drop(in_tx);
        decompress_stage(in_rx, out_tx, CancellationToken::new()).await;

        // The corrupt frame is skipped, the next one still flows.
        assert_eq!(out_rx.recv().await.unwrap(), b"survivor".to_vec());
        assert!(out_rx.recv().await.is_none());
    }
}
