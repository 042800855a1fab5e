//! # ps-capture
//!
//! Packet capture engine for PacketStreamer's sensor role.
//!
//! The interface manager periodically re-derives which (interface, ports)
//! pairs should be captured, keeps one live pcap handle per interface, and
//! runs one blocking reader thread per handle. Readers serialize every kept
//! packet as a classic libpcap record and push it onto the gather queue.

mod bpf;
mod error;
mod interface;
pub mod manager;
mod plan;
pub mod reader;
pub mod records;

pub use bpf::{create_bpf_string, Resolver, SystemResolver};
pub use error::CaptureError;
pub use interface::up_interfaces;
pub use plan::{derive_plan, diff_plans};
