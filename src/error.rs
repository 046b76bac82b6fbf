// Error types for the motor link and startup configuration

/// Errors talking to the motor controller over its link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link to {port} is not open")]
    NotOpen { port: String },

    #[error("Expected ack 0xFF for command {command}, got 0x{got:02X}")]
    BadAck { command: u8, got: u8 },

    #[error("Timeout waiting for reply to command {command}")]
    Timeout { command: u8 },
}

/// Errors loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid constant {name}: {reason}")]
    InvalidConstant { name: &'static str, reason: String },

    #[error("Malformed pose '{0}', expected \"x y heading\"")]
    MalformedPose(String),
}
