use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio device available: {0}")]
    HardwareUnavailable(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlay(String),

    #[error("Buffer full for producer '{0}', frame dropped")]
    BufferOverflow(String),

    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    #[error("Audio asset error: {0}")]
    Asset(String),

    #[error("Recording failed: {0}")]
    Recording(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
