//! IPP methods
//!
//! Defines the request methods this client sends to the terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request methods understood by the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    /// Query terminal state
    GetStatus,

    /// Card purchase (`AMOUNT`, `CURRENCY`, optional `REFERENCE`)
    Purchase,

    /// Finalize a transaction left open by a previous session
    CompleteTx,

    /// Discard a transaction left open by a previous session
    CancelTx,

    /// Reverse the last transaction
    Reversal,
}

impl Method {
    /// Wire name sent in the `METHOD` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetStatus => "GET_STATUS",
            Method::Purchase => "PURCHASE",
            Method::CompleteTx => "COMPLETE_TX",
            Method::CancelTx => "CANCEL_TX",
            Method::Reversal => "REVERSAL",
        }
    }

    /// Whether this method belongs to the idle-recovery sequence
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            Method::CompleteTx | Method::CancelTx | Method::Reversal
        )
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim() {
            "GET_STATUS" => Some(Method::GetStatus),
            "PURCHASE" => Some(Method::Purchase),
            "COMPLETE_TX" => Some(Method::CompleteTx),
            "CANCEL_TX" => Some(Method::CancelTx),
            "REVERSAL" => Some(Method::Reversal),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        for method in [
            Method::GetStatus,
            Method::Purchase,
            Method::CompleteTx,
            Method::CancelTx,
            Method::Reversal,
        ] {
            assert_eq!(Method::from_wire(method.as_str()), Some(method));
        }
        assert_eq!(Method::from_wire("REFUND"), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&Method::CompleteTx).unwrap();
        assert_eq!(json, "\"COMPLETE_TX\"");
    }
}
