//! Classic libpcap serialization.
//!
//! Every batch shipped by a sensor is a concatenation of these records, and
//! every sink that produces a pcap file prefixes its stream with this
//! global header. All fields are written little-endian.

/// Length of the global pcap file header.
pub const FILE_HEADER_LEN: usize = 24;

/// Length of one per-packet record header.
pub const RECORD_HEADER_LEN: usize = 16;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

/// Build a pcap global header for the given snaplen.
pub fn file_header(snaplen: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FILE_HEADER_LEN);
    buf.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
    buf.extend_from_slice(&VERSION_MINOR.to_le_bytes());
    buf.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    buf.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    buf.extend_from_slice(&snaplen.to_le_bytes());
    buf.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    buf
}

/// Serialize one packet as a pcap record: 16-byte header plus the captured
/// bytes.
pub fn record_bytes(ts_sec: u32, ts_usec: u32, orig_len: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    buf.extend_from_slice(&ts_sec.to_le_bytes());
    buf.extend_from_slice(&ts_usec.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes()); // caplen
    buf.extend_from_slice(&orig_len.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}
