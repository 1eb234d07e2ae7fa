//! Request/response correlation
//!
//! An [`IppSession`] owns a transport and runs request exchanges over it:
//! every request carries a fresh session id (SID), and only response frames
//! echoing the same `METHOD` and `SID` are accepted as answers.

use std::time::{Duration, Instant};

use uuid::Uuid;

use super::frame::{encode_frame, Frame, FrameReader};
use super::{Method, SigmaError, Transport, PROTOCOL_NAME};
use crate::config::{SigmaConfig, Timeouts};

/// Format a `KEY=VALUE` request line
pub fn field(key: &str, value: impl std::fmt::Display) -> String {
    format!("{}={}", key, value)
}

/// Outcome of waiting on one request
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Last matching frame seen
    pub frame: Frame,
    /// Number of matching frames received
    pub frames: usize,
    /// Whether the exchange finished (completion predicate met or immediate
    /// rejection) rather than running out of budget
    pub completed: bool,
}

/// A request/response session over one transport
pub struct IppSession<T: Transport> {
    transport: T,
    reader: FrameReader,
    protocol_version: String,
    /// Upper bound for a single read attempt
    read_timeout: Duration,
    pub(crate) timeouts: Timeouts,
}

impl<T: Transport> IppSession<T> {
    /// Create a session with explicit settings
    pub fn new(
        transport: T,
        protocol_version: impl Into<String>,
        read_timeout: Duration,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            transport,
            reader: FrameReader::new(),
            protocol_version: protocol_version.into(),
            read_timeout,
            timeouts,
        }
    }

    /// Create a session using the settings from a [`SigmaConfig`]
    pub fn from_config(transport: T, config: &SigmaConfig) -> Self {
        Self::new(
            transport,
            config.protocol_version.clone(),
            config.read_timeout(),
            config.timeouts,
        )
    }

    /// Protocol version sent in every request
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Budgets used by the terminal and purchase operations
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Close the transport and hand it back
    pub fn into_transport(mut self) -> T {
        self.transport.close();
        self.transport
    }

    /// Close the underlying transport. Safe to call more than once.
    pub fn close(&mut self) {
        self.reader.clear();
        self.transport.close();
    }

    /// Send a request and return its session id.
    ///
    /// `PROTOCOL` and `METHOD` are always the first two lines; the terminal
    /// parses them positionally.
    pub fn send_request(
        &mut self,
        method: Method,
        extra_fields: &[String],
    ) -> Result<String, SigmaError> {
        let sid = Uuid::new_v4().to_string();

        let mut lines = Vec::with_capacity(4 + extra_fields.len());
        lines.push(field("PROTOCOL", PROTOCOL_NAME));
        lines.push(field("METHOD", method));
        lines.push(field("VERSION", &self.protocol_version));
        lines.push(field("SID", &sid));
        lines.extend(extra_fields.iter().cloned());

        let bytes = encode_frame(&lines)?;
        tracing::debug!(method = %method, sid = %sid, bytes = bytes.len(), lines = ?lines, "TX");
        self.transport.write(&bytes)?;
        Ok(sid)
    }

    /// Wait for the final response to a request.
    ///
    /// Returns `None` when nothing answered within `first_wait`. If the first
    /// answer carries a non-zero `STATUS` it is returned at once. Otherwise the
    /// last answer seen is returned once a final frame arrives or `final_wait`
    /// runs out; callers check [`Frame::is_final`] to tell the two apart.
    pub fn await_response(
        &mut self,
        method: Method,
        sid: &str,
        first_wait: Duration,
        final_wait: Duration,
    ) -> Result<Option<Frame>, SigmaError> {
        Ok(self
            .await_exchange(method, sid, first_wait, final_wait, Frame::is_final)?
            .map(|exchange| exchange.frame))
    }

    /// Two-phase wait with a caller-supplied completion predicate.
    ///
    /// Phase one waits up to `first_wait` for any answer. Phase two keeps
    /// reading answers for up to `final_wait` until `is_complete` holds.
    pub fn await_exchange<F>(
        &mut self,
        method: Method,
        sid: &str,
        first_wait: Duration,
        final_wait: Duration,
        is_complete: F,
    ) -> Result<Option<Exchange>, SigmaError>
    where
        F: Fn(&Frame) -> bool,
    {
        let wire_method = method.as_str();

        let first_deadline = Instant::now() + first_wait;
        let first = loop {
            match self.next_frame(first_deadline)? {
                Some(frame) if frame.answers(wire_method, sid) => break frame,
                Some(frame) => log_unmatched(&frame, wire_method, sid),
                None if Instant::now() >= first_deadline => {
                    tracing::debug!(method = wire_method, sid, "no response within {:?}", first_wait);
                    return Ok(None);
                }
                None => {}
            }
        };
        log_received(&first, 1);

        if first.is_rejection() {
            tracing::debug!(method = wire_method, status = ?first.status(), "immediate rejection");
            return Ok(Some(Exchange {
                frame: first,
                frames: 1,
                completed: true,
            }));
        }

        let mut exchange = Exchange {
            completed: is_complete(&first),
            frame: first,
            frames: 1,
        };
        if exchange.completed {
            return Ok(Some(exchange));
        }

        let final_deadline = Instant::now() + final_wait;
        while Instant::now() < final_deadline {
            match self.next_frame(final_deadline)? {
                Some(frame) if frame.answers(wire_method, sid) => {
                    exchange.frames += 1;
                    log_received(&frame, exchange.frames);
                    exchange.completed = is_complete(&frame);
                    exchange.frame = frame;
                    if exchange.completed {
                        return Ok(Some(exchange));
                    }
                }
                Some(frame) => log_unmatched(&frame, wire_method, sid),
                None => {}
            }
        }

        tracing::debug!(
            method = wire_method,
            sid,
            frames = exchange.frames,
            "exchange incomplete after {:?}",
            final_wait
        );
        Ok(Some(exchange))
    }

    /// Send a request and wait for it in one step
    pub fn request<F>(
        &mut self,
        method: Method,
        extra_fields: &[String],
        first_wait: Duration,
        final_wait: Duration,
        is_complete: F,
    ) -> Result<Option<Exchange>, SigmaError>
    where
        F: Fn(&Frame) -> bool,
    {
        let sid = self.send_request(method, extra_fields)?;
        self.await_exchange(method, &sid, first_wait, final_wait, is_complete)
    }

    /// One bounded read attempt. A frame already underway may keep reading
    /// up to `deadline`, never past it.
    fn next_frame(&mut self, deadline: Instant) -> Result<Option<Frame>, SigmaError> {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        self.reader
            .read_frame_until(&mut self.transport, self.read_timeout, deadline)
    }
}

fn log_received(frame: &Frame, index: usize) {
    tracing::debug!(
        method = ?frame.method(),
        sid = ?frame.sid(),
        index,
        fields = ?frame.fields.as_map(),
        "RX"
    );
}

fn log_unmatched(frame: &Frame, method: &str, sid: &str) {
    tracing::debug!(
        expected_method = method,
        expected_sid = sid,
        method = ?frame.method(),
        sid = ?frame.sid(),
        "discarding unrelated frame"
    );
}
