use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read the config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse the config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid pcapMode \"{0}\"")]
    InvalidPcapMode(String),

    #[error("no input configured")]
    NoInputConfigured,

    #[error("no port configured for input")]
    NoPortConfiguredForInput,

    #[error("no output configured")]
    NoOutputConfigured,

    #[error("no port configured for server output")]
    NoPortConfiguredForServerOutput,
}
