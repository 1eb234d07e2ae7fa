//! Protocol errors

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the terminal
#[derive(Error, Debug)]
pub enum SigmaError {
    /// Device could not be opened, or a write failed
    #[error("Serial transport error: {0}")]
    Transport(String),

    /// A frame could not be constructed (programmer error)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No qualifying response arrived within the budget.
    ///
    /// The outcome is unknown: a purchase may or may not have been charged.
    #[error("Timed out waiting for {operation} response")]
    Timeout {
        /// Method or operation that timed out
        operation: String,
        /// Fields of the last frame seen for this exchange, if any
        last_fields: Option<BTreeMap<String, String>>,
    },

    /// The terminal could not be brought to idle before a purchase
    #[error("Terminal not ready (last status: {})", last_status.as_deref().unwrap_or("none"))]
    TerminalNotReady {
        /// STATUS field of the last status response, if any arrived
        last_status: Option<String>,
    },

    /// The terminal gave a definitive decline
    #[error("Terminal rejected the request with status {status}")]
    Rejected {
        /// STATUS field
        status: String,
        /// STAGE field
        stage: String,
        /// All fields of the rejecting frame
        fields: BTreeMap<String, String>,
    },

    /// Another operation holds the terminal
    #[error("Terminal busy (waited {waited:?})")]
    Busy {
        /// How long the caller waited for the guard
        waited: Duration,
    },

    /// Caller supplied an unusable request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// None of the candidate device nodes exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O failure, e.g. on the lock file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SigmaError {
    /// Whether the terminal may have acted on the request.
    ///
    /// A kiosk must not assume "no charge" for these; it should re-check status
    /// or reconcile manually.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, SigmaError::Timeout { .. } | SigmaError::Transport(_))
    }

    /// Whether this error points at a hardware or link fault
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            SigmaError::Transport(_) | SigmaError::PortNotFound(_) | SigmaError::Io(_)
        )
    }
}
