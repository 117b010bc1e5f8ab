//! Error types for parsing and validating wire values
//!
//! Uses thiserror so that callers can wrap these with `#[from]`.

use thiserror::Error;

/// Raised when an instrument, interval, routing key or command cannot be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid instrument: {0}")]
    InvalidInstrument(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("Invalid command payload: {0}")]
    InvalidCommand(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InvalidInterval("7m".to_string());
        assert_eq!(err.to_string(), "Invalid interval: 7m");

        let err = ParseError::InvalidRoutingKey("BTCUSDT.trade".to_string());
        assert_eq!(err.to_string(), "Invalid routing key: BTCUSDT.trade");
    }
}
