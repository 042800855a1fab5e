use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid magic bytes in frame header")]
    BadMagic,

    #[error("frame length {0} exceeds the maximum encoded length")]
    LengthTooLarge(u32),

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("connection timed out")]
    Timeout,

    #[error("connection closed abruptly")]
    ClosedAbruptly,

    #[error("authentication failed: {0}")]
    AuthRejected(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("tried to write {0} times, bailing out")]
    WriteBudgetExhausted(usize),

    #[error("no server output configured")]
    NoServerOutput,

    #[error("no input configured")]
    NoInput,

    #[error("all sinks failed")]
    AllSinksFailed,

    #[error(transparent)]
    Capture(#[from] ps_capture::CaptureError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
