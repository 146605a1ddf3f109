//! Protocol error types

use thiserror::Error;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet carried a type tag this host does not understand
    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// Buffer too small to hold a packet header
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Payload does not fit the configured wire format
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Wire format cannot carry the protocol's packets
    #[error("Invalid wire format: {0}")]
    InvalidFormat(String),
}

/// Movie feature flags this host refuses to play back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFeature {
    /// Movie starts from a savestate rather than power-on
    Savestate,
    /// Movie records three controllers
    ThreePlayer,
}

impl std::fmt::Display for UnsupportedFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsupportedFeature::Savestate => write!(f, "movie requires a savestate"),
            UnsupportedFeature::ThreePlayer => write!(f, "3-player movie"),
        }
    }
}

/// Movie validation errors
#[derive(Debug, Error)]
pub enum MovieError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad movie size: {size} bytes ({frames} frames)")]
    BadSize { size: usize, frames: usize },

    #[error("Bad movie signature")]
    BadSignature,

    #[error("Unhandled flag: {0}")]
    UnsupportedFeature(UnsupportedFeature),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownPacketType(0x42);
        assert_eq!(err.to_string(), "Unknown packet type: 0x42");

        let err = MovieError::UnsupportedFeature(UnsupportedFeature::Savestate);
        assert!(err.to_string().contains("savestate"));
    }

    #[test]
    fn test_bad_size_display() {
        let err = MovieError::BadSize { size: 65, frames: 0 };
        let msg = format!("{}", err);
        assert!(msg.contains("65 bytes"));
    }
}
