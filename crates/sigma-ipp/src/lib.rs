//! # Sigma IPP
//!
//! Client for myPOS Sigma card terminals speaking IPP over a USB serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Length-prefixed `KEY=VALUE` frame encoding and decoding
//! - Session-id correlation of requests and multi-frame responses
//! - Terminal status checks and recovery of unfinished transactions
//! - Card purchases with approval classification
//! - Mutual exclusion of terminal access, in-process and across processes
//! - A simulated terminal for tests and demos
//!
//! ## Example
//!
//! ```rust,ignore
//! use sigma_ipp::prelude::*;
//!
//! let client = SigmaClient::new(SigmaConfig::default());
//!
//! // Charge £1.50
//! let result = client.purchase(150, "826", "ORDER-42")?;
//! if result.approved() {
//!     println!("Approved, txid {:?}", result.transaction_id());
//! }
//! ```

pub mod client;
pub mod config;
pub mod guard;
pub mod protocol;
pub mod purchase;
pub mod sim;
pub mod terminal;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{Connector, SerialConnector, SigmaClient};
    pub use crate::config::{SigmaConfig, Timeouts};
    pub use crate::guard::{GuardToken, TerminalGuard};
    pub use crate::protocol::{Frame, IppSession, Method, SigmaError, Transport};
    pub use crate::purchase::{AmountFormat, PurchaseRequest, PurchaseResult};
    pub use crate::terminal::{IdleReport, TerminalStatus};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
