use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("s3 plugin: {0}")]
    S3(String),

    #[error("kafka plugin: {0}")]
    Kafka(String),
}
