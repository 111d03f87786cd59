use thiserror::Error;

use pulsecompiler_backend::PulserError;

/// Error reported by a card driver or the synthesizer.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("driver error {code}: {msg}")]
pub struct TransportError {
    pub code: i32,
    pub msg: String,
}

impl TransportError {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CtrlError {
    #[error(transparent)]
    Pulser(#[from] PulserError),

    #[error("{op} failed on {card}: {msg}")]
    HardwareFailure {
        card: String,
        op: &'static str,
        msg: String,
    },

    #[error("failed to switch effective user id: {0}")]
    Privilege(String),

    #[error("RF pulses are in use but no synthesizer is bound")]
    MissingSynthesizer,
}

pub type Result<T, E = CtrlError> = std::result::Result<T, E>;
