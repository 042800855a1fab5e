//! Per-role configuration validation, run by the binary before a pipeline
//! is started. Failures here are fatal to the process.

use crate::{Config, ConfigError};

/// A receiver must have a listen address with a port.
pub fn validate_receiver(config: &Config) -> Result<(), ConfigError> {
    let input = config.input.as_ref().ok_or(ConfigError::NoInputConfigured)?;
    if input.port.is_none() {
        return Err(ConfigError::NoPortConfiguredForInput);
    }
    Ok(())
}

/// A sensor must have at least one output, and a server output must carry
/// a port.
pub fn validate_sensor(config: &Config) -> Result<(), ConfigError> {
    let has_plugin = config
        .output
        .plugins
        .as_ref()
        .map(|p| p.s3.is_some() || p.kafka.is_some())
        .unwrap_or(false);
    if config.output.file.is_none() && config.output.server.is_none() && !has_plugin {
        return Err(ConfigError::NoOutputConfigured);
    }
    if let Some(server) = &config.output.server {
        if server.port.is_none() {
            return Err(ConfigError::NoPortConfiguredForServerOutput);
        }
    }
    Ok(())
}
