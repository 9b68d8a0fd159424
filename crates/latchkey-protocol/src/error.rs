use thiserror::Error;

/// Errors raised while framing or parsing wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Invalid bridge message: {0}")]
    InvalidMessage(String),

    #[error("Invalid radio frame: {0}")]
    InvalidRadioFrame(String),

    #[error("Invalid device key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
