//! Sigma IPP serial protocol
//!
//! Implements the length-prefixed `KEY=VALUE` protocol spoken by myPOS Sigma
//! terminals over USB-CDC, and the session-id correlation of requests and
//! their (possibly multi-frame) responses.

mod error;
pub mod frame;
pub mod methods;
pub mod serial;
mod session;
pub mod transport;

pub use error::SigmaError;
pub use frame::{encode_frame, Fields, Frame, FrameReader};
pub use methods::Method;
pub use serial::{existing_candidates, list_ports, PortInfo, PortKind};
pub use session::{field, Exchange, IppSession};
pub use transport::{SerialTransport, Transport};

/// Default baud rate for the terminal
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Value of the `PROTOCOL` field, always the first request line
pub const PROTOCOL_NAME: &str = "IPP";

/// Default `VERSION` field value
pub const DEFAULT_PROTOCOL_VERSION: &str = "202";

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest frame the 16-bit length prefix can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
