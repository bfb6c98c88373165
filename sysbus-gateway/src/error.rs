//! Error types for the gateway core.

use thiserror::Error;

use crate::config::Space;

/// Failure to interpret one frame received from the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Bad CRC or malformed frame.
    #[error("Corrupt frame: {0}")]
    Corrupt(String),

    /// Well-formed frame that does not answer the outstanding request.
    #[error("Response mismatch: {0}")]
    Mismatch(String),

    /// The slave answered with a Modbus exception.
    #[error("Slave exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },

    /// Function code this codec does not speak.
    #[error("Unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),
}

impl DecodeError {
    /// Whether a fresh attempt of the same transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecodeError::Corrupt(_) | DecodeError::Mismatch(_))
    }
}

/// Failure of one bus transaction.
#[derive(Debug, Error)]
pub enum BusError {
    /// Every attempt failed.
    #[error("Slave {slave} unreachable after {attempts} attempt(s): {last_error}")]
    Unreachable {
        slave: u8,
        attempts: u32,
        last_error: String,
    },

    /// The slave refused the request.
    #[error("Slave {slave} rejected function 0x{function:02X} with exception 0x{code:02X}")]
    Rejected { slave: u8, function: u8, code: u8 },

    /// The request cannot be expressed on the wire.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Persistence failure of the register store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Register store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Errors returned to API callers by the gateway facade.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No register is mapped at this address.
    #[error("No {space} register mapped at address {address}")]
    UnknownRegister { space: Space, address: u16 },

    /// No register carries this name.
    #[error("Unknown point '{0}'")]
    UnknownPoint(String),

    /// No group carries this name.
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    /// Writes are only possible in the holding space.
    #[error("{space} register {address} is read-only")]
    ReadOnly { space: Space, address: u16 },

    /// Value rejected by the register definition.
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    /// The write could not be made durable.
    #[error(transparent)]
    Store(#[from] StoreError),
}
