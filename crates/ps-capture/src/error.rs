use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("network interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("failed to list interfaces: {0}")]
    InterfaceList(String),

    #[error("could not open interface {0}: {1}")]
    InterfaceOpen(String, String),

    #[error("invalid BPF filter '{0}': {1}")]
    BadFilter(String, String),

    #[error("could not resolve host {0}: {1}")]
    Resolve(String, String),

    #[error("capture error: {0}")]
    Capture(String),
}

// Allow conversion from pcap errors
impl From<pcap::Error> for CaptureError {
    fn from(err: pcap::Error) -> Self {
        CaptureError::Capture(err.to_string())
    }
}
