//! # ps-streamer
//!
//! The end-to-end streaming pipeline shared by both PacketStreamer roles.
//!
//! A sensor batches captured pcap records, compresses each batch, and ships
//! it as a magic-prefixed, length-prefixed frame over TCP (optionally TLS,
//! optionally authenticated). A receiver terminates the transport,
//! reconstructs the packet stream, and fans it out to its sinks and plugin
//! pipelines.

pub mod auth;
pub mod compress;
mod error;
pub mod frame;
pub mod gather;
pub mod output;
pub mod receiver;
pub mod sensor;
pub mod stats;
pub mod tls;
pub mod transport;
pub mod writer;

pub use error::StreamError;
