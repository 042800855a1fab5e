//! Wire framing.
//!
//! Every unit on the wire is `magic(4) | len(4, LE) | payload(len)`. Bit 31
//! of the length word signals whether the payload is a compressed block; the
//! low 31 bits carry the payload length. The same magic also opens the
//! authentication exchange and prefixes broker files.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::StreamError;

/// Stream magic, constant across protocol versions.
pub const MAGIC: [u8; 4] = [0xde, 0xef, 0xec, 0xe0];

/// Frame header: magic plus the length word.
pub const HEADER_LEN: usize = MAGIC.len() + 4;

/// Read deadline applied to every socket read.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(60);

const COMPRESSED_FLAG: u32 = 1 << 31;

/// One deframed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    pub compressed: bool,
}

/// Worst-case encoded size for a plaintext block of `max_plain_len` bytes.
pub fn max_encoded_len(max_plain_len: usize) -> usize {
    snap::raw::max_compress_len(max_plain_len)
}

/// Assemble a frame into `buf`, replacing its contents.
pub fn encode_into(
    buf: &mut Vec<u8>,
    payload: &[u8],
    compressed: bool,
    max_payload_len: usize,
) -> Result<(), StreamError> {
    if payload.len() > max_payload_len {
        return Err(StreamError::PayloadTooLarge(payload.len()));
    }
    let mut len = payload.len() as u32;
    if compressed {
        len |= COMPRESSED_FLAG;
    }
    buf.clear();
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Read one frame from `stream`.
///
/// Both the header and the payload reads carry the 60 second deadline. Any
/// deviation (wrong magic, oversized length, EOF mid-frame) is fatal to
/// the connection and surfaces as the corresponding error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_encoded_len: usize,
) -> Result<Block, StreamError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_deadline(stream, &mut header).await?;

    if header[..MAGIC.len()] != MAGIC {
        return Err(StreamError::BadMagic);
    }
    let word = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let compressed = word & COMPRESSED_FLAG != 0;
    let len = (word & !COMPRESSED_FLAG) as usize;
    if len > max_encoded_len.saturating_sub(HEADER_LEN) {
        return Err(StreamError::LengthTooLarge(len as u32));
    }

    let mut data = vec![0u8; len];
    read_exact_deadline(stream, &mut data).await?;
    Ok(Block { data, compressed })
}

pub(crate) async fn read_exact_deadline<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<(), StreamError> {
    match tokio::time::timeout(CONN_TIMEOUT, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(StreamError::ClosedAbruptly),
        Ok(Err(e)) => Err(StreamError::Io(e)),
        Err(_) => Err(StreamError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let payload = vec![0x41u8; 32];
        let mut frame = Vec::new();
        encode_into(&mut frame, &payload, false, MAX).unwrap();

        assert_eq!(frame.len(), HEADER_LEN + 32);
        assert_eq!(
            &frame[..HEADER_LEN],
            &[0xde, 0xef, 0xec, 0xe0, 0x20, 0x00, 0x00, 0x00]
        );

        let block = read_frame(&mut frame.as_slice(), MAX).await.unwrap();
        assert_eq!(block.data, payload);
        assert!(!block.compressed);
    }

    #[tokio::test]
    async fn test_compressed_flag_round_trip() {
        let payload = b"compressed bytes".to_vec();
        let mut frame = Vec::new();
        encode_into(&mut frame, &payload, true, MAX).unwrap();
        // Flag lives in the top bit of the length word, not in the length.
        assert_eq!(frame[7] & 0x80, 0x80);

        let block = read_frame(&mut frame.as_slice(), MAX).await.unwrap();
        assert_eq!(block.data, payload);
        assert!(block.compressed);
    }

    #[tokio::test]
    async fn test_bad_magic_is_rejected() {
        let mut frame = Vec::new();
        encode_into(&mut frame, b"data", false, MAX).unwrap();
        frame[0] = 0x00;
        let err = read_frame(&mut frame.as_slice(), MAX).await.unwrap_err();
        assert!(matches!(err, StreamError::BadMagic));
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&(MAX as u32).to_le_bytes());
        let err = read_frame(&mut frame.as_slice(), MAX).await.unwrap_err();
        assert!(matches!(err, StreamError::LengthTooLarge(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed_abruptly() {
        let mut frame = Vec::new();
        encode_into(&mut frame, &[0x41u8; 32], false, MAX).unwrap();
        frame.truncate(HEADER_LEN + 10);
        let err = read_frame(&mut frame.as_slice(), MAX).await.unwrap_err();
        assert!(matches!(err, StreamError::ClosedAbruptly));
    }

    #[test]
    fn test_payload_too_large_fails_encode() {
        let mut frame = Vec::new();
        let err = encode_into(&mut frame, &[0u8; 65], false, 64).unwrap_err();
        assert!(matches!(err, StreamError::PayloadTooLarge(65)));
    }
}
