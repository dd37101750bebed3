pub mod commands;
pub mod reports;
pub mod types;

pub use commands::*;
pub use reports::*;
pub use types::*;

use thiserror::Error;

/// Malformed inbound payload. Rejected before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u8 },
    #[error("unknown {field} value '{value}'")]
    UnknownValue { field: &'static str, value: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
}
