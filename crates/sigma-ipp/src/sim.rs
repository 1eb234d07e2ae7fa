//! Simulated terminal for testing
//!
//! Speaks the Sigma IPP wire protocol in memory so the full client can be
//! exercised without hardware. The terminal's state lives behind an
//! `Arc<Mutex<_>>` shared by every transport a [`SimConnector`] hands out, so
//! tests can script behaviour up front and inspect the request log afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use crate::client::Connector;
use crate::protocol::{encode_frame, Fields, Frame, Method, SigmaError, Transport, LENGTH_PREFIX_LEN};
use crate::purchase::AmountFormat;
use crate::terminal::{STATUS_IDLE, STATUS_NOT_COMPLETED};

/// Longest single sleep inside a read attempt
const SIM_TICK: Duration = Duration::from_millis(2);

/// How the simulated terminal answers `PURCHASE`
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseBehavior {
    /// Progress through the given stages, then approve
    Approve {
        /// Stages reported before the final frame
        progress: Vec<u32>,
    },
    /// Answer once with a non-zero status
    Decline {
        /// STATUS value
        status: i64,
        /// STAGE value
        stage: u32,
    },
    /// Never answer
    Silent,
    /// Report progress but never send a final frame
    Stall,
    /// Reject amounts written in the wrong format, approve the rest
    RequireFormat(AmountFormat),
}

/// How the simulated terminal leaves status 20
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryRule {
    /// Idle once both COMPLETE_TX and CANCEL_TX were received, in that order
    CompleteThenCancel,
    /// Only REVERSAL clears the stuck transaction
    ReversalOnly,
    /// Stays stuck forever
    Never,
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    bytes: Vec<u8>,
}

/// Shared state of a simulated terminal
#[derive(Debug)]
pub struct SimState {
    /// Current STATUS reported by GET_STATUS
    pub status: i64,
    /// PURCHASE behaviour once `purchase_script` is used up
    pub purchase: PurchaseBehavior,
    /// Behaviours for the next PURCHASE requests, consumed in order
    pub purchase_script: VecDeque<PurchaseBehavior>,
    /// Recovery behaviour while stuck on status 20
    pub recovery: RecoveryRule,
    /// Delay before the first frame of each answer
    pub response_delay: Duration,
    /// Delay between frames of a multi-frame answer
    pub frame_interval: Duration,
    /// Send a frame with a foreign SID ahead of every answer
    pub send_decoys: bool,
    /// Make every write fail
    pub fail_writes: bool,
    /// Make the connector fail to open
    pub fail_connect: bool,
    /// Every request received, in order
    pub requests: Vec<Fields>,
    /// Transports currently open
    pub open_transports: usize,
    /// Most transports ever open at once
    pub max_open_transports: usize,
    /// Transports opened in total
    pub connects: usize,
    complete_seen: bool,
    rx: Vec<u8>,
    outbound: VecDeque<Scheduled>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            status: STATUS_IDLE,
            purchase: PurchaseBehavior::Approve {
                progress: vec![1, 3, 5],
            },
            purchase_script: VecDeque::new(),
            recovery: RecoveryRule::CompleteThenCancel,
            response_delay: Duration::from_millis(1),
            frame_interval: Duration::from_millis(1),
            send_decoys: false,
            fail_writes: false,
            fail_connect: false,
            requests: Vec::new(),
            open_transports: 0,
            max_open_transports: 0,
            connects: 0,
            complete_seen: false,
            rx: Vec::new(),
            outbound: VecDeque::new(),
        }
    }
}

impl SimState {
    /// Methods received, in order
    pub fn methods(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter_map(|f| f.get("METHOD").map(str::to_string))
            .collect()
    }

    /// Requests received for one method
    pub fn requests_for(&self, method: Method) -> Vec<&Fields> {
        self.requests
            .iter()
            .filter(|f| f.get("METHOD") == Some(method.as_str()))
            .collect()
    }

    fn handle_inbound(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
        while self.rx.len() >= LENGTH_PREFIX_LEN {
            let total = BigEndian::read_u16(&self.rx[..LENGTH_PREFIX_LEN]) as usize;
            if total < LENGTH_PREFIX_LEN {
                self.rx.clear();
                break;
            }
            if self.rx.len() < total {
                break;
            }
            let raw: Vec<u8> = self.rx.drain(..total).collect();
            if let Some(frame) = Frame::decode(&raw) {
                self.respond(frame);
            }
        }
    }

    fn respond(&mut self, request: Frame) {
        let method = request.method().unwrap_or_default().to_string();
        let sid = request.sid().unwrap_or_default().to_string();
        self.requests.push(request.fields.clone());

        let answers: Vec<Vec<String>> = match Method::from_wire(&method) {
            Some(Method::GetStatus) => vec![vec![format!("STATUS={}", self.status)]],
            Some(Method::CompleteTx) => {
                self.complete_seen = true;
                vec![vec!["STATUS=0".to_string(), "STAGE=6".to_string()]]
            }
            Some(Method::CancelTx) => {
                if self.recovery == RecoveryRule::CompleteThenCancel && self.complete_seen {
                    self.status = STATUS_IDLE;
                }
                vec![vec!["STATUS=0".to_string(), "STAGE=6".to_string()]]
            }
            Some(Method::Reversal) => {
                if self.recovery == RecoveryRule::ReversalOnly {
                    self.status = STATUS_IDLE;
                }
                vec![vec!["STATUS=0".to_string()]]
            }
            Some(Method::Purchase) => self.purchase_answers(&request),
            None => vec![vec!["STATUS=99".to_string()]],
        };

        let mut due = Instant::now() + self.response_delay;
        if self.send_decoys && !answers.is_empty() {
            self.schedule(due, &method, "decoy-sid", vec!["STATUS=0".to_string()]);
        }
        for lines in answers {
            self.schedule(due, &method, &sid, lines);
            due += self.frame_interval;
        }
    }

    fn purchase_answers(&mut self, request: &Frame) -> Vec<Vec<String>> {
        if self.status != STATUS_IDLE {
            return vec![vec![format!("STATUS={}", self.status)]];
        }

        let approve = |progress: &[u32]| {
            let mut frames: Vec<Vec<String>> = progress
                .iter()
                .map(|stage| {
                    vec![
                        "STATUS=0".to_string(),
                        format!("STAGE={}", stage),
                        "TIMEOUT=60".to_string(),
                    ]
                })
                .collect();
            frames.push(vec![
                "STATUS=0".to_string(),
                "STAGE=6".to_string(),
                "TIMEOUT=".to_string(),
                "TXID=SIM-0001".to_string(),
                "AUTH_CODE=A1B2C3".to_string(),
                "RECEIPT=APPROVED".to_string(),
            ]);
            frames
        };

        let behavior = self
            .purchase_script
            .pop_front()
            .unwrap_or_else(|| self.purchase.clone());
        match &behavior {
            PurchaseBehavior::Approve { progress } => approve(progress),
            PurchaseBehavior::Decline { status, stage } => {
                vec![vec![format!("STATUS={}", status), format!("STAGE={}", stage)]]
            }
            PurchaseBehavior::Silent => Vec::new(),
            PurchaseBehavior::Stall => vec![vec![
                "STATUS=0".to_string(),
                "STAGE=2".to_string(),
                "TIMEOUT=120".to_string(),
            ]],
            PurchaseBehavior::RequireFormat(format) => {
                let amount = request.get("AMOUNT").unwrap_or_default();
                let is_decimal = amount.contains('.');
                if is_decimal == (*format == AmountFormat::Decimal) {
                    approve(&[5])
                } else {
                    vec![vec!["STATUS=3".to_string()]]
                }
            }
        }
    }

    fn schedule(&mut self, due: Instant, method: &str, sid: &str, lines: Vec<String>) {
        let mut all = vec![format!("METHOD={}", method), format!("SID={}", sid)];
        all.extend(lines);
        match encode_frame(&all) {
            Ok(bytes) => self.outbound.push_back(Scheduled { due, bytes }),
            Err(e) => tracing::error!("simulated terminal cannot encode answer: {}", e),
        }
    }

    /// Take every scheduled byte that is due, plus the next due time
    fn take_due(&mut self, now: Instant) -> (Vec<u8>, Option<Instant>) {
        let mut out = Vec::new();
        while let Some(front) = self.outbound.front() {
            if front.due > now {
                return (out, Some(front.due));
            }
            if let Some(item) = self.outbound.pop_front() {
                out.extend(item.bytes);
            }
        }
        (out, None)
    }
}

/// Handle to a simulated terminal's shared state
#[derive(Debug, Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    /// Terminal that is idle and approves purchases
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal stuck on status 20
    pub fn stuck(recovery: RecoveryRule) -> Self {
        let handle = Self::new();
        handle.update(|s| {
            s.status = STATUS_NOT_COMPLETED;
            s.recovery = recovery;
        });
        handle
    }

    /// Lock the state
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the state
    pub fn update(&self, f: impl FnOnce(&mut SimState)) {
        f(&mut self.state());
    }

    /// Methods received so far
    pub fn methods(&self) -> Vec<String> {
        self.state().methods()
    }

    /// Open a transport onto this terminal
    pub fn transport(&self) -> SimulatedTerminal {
        let mut state = self.state();
        state.connects += 1;
        state.open_transports += 1;
        state.max_open_transports = state.max_open_transports.max(state.open_transports);
        SimulatedTerminal {
            handle: self.clone(),
            open: true,
        }
    }
}

/// A transport connected to a simulated terminal
#[derive(Debug)]
pub struct SimulatedTerminal {
    handle: SimHandle,
    open: bool,
}

impl SimulatedTerminal {
    /// Shared state behind this transport
    pub fn handle(&self) -> &SimHandle {
        &self.handle
    }
}

impl Transport for SimulatedTerminal {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SigmaError> {
        if !self.open {
            return Err(SigmaError::Transport("simulated terminal closed".to_string()));
        }
        let mut state = self.handle.state();
        if state.fail_writes {
            return Err(SigmaError::Transport("broken pipe".to_string()));
        }
        state.handle_inbound(bytes);
        Ok(())
    }

    fn read_attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, SigmaError> {
        if !self.open {
            return Err(SigmaError::Transport("simulated terminal closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let (bytes, next_due) = self.handle.state().take_due(now);
            if !bytes.is_empty() {
                return Ok(bytes);
            }
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let until_due = next_due
                .map(|due| due.saturating_duration_since(now))
                .unwrap_or(remaining);
            std::thread::sleep(remaining.min(until_due).min(SIM_TICK).max(Duration::from_micros(100)));
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.handle.state();
            state.open_transports = state.open_transports.saturating_sub(1);
        }
    }
}

impl Drop for SimulatedTerminal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connector handing out transports onto one simulated terminal
#[derive(Debug, Clone, Default)]
pub struct SimConnector {
    handle: SimHandle,
}

impl SimConnector {
    /// Connect to the given terminal
    pub fn new(handle: SimHandle) -> Self {
        Self { handle }
    }

    /// Terminal this connector opens
    pub fn handle(&self) -> &SimHandle {
        &self.handle
    }
}

impl Connector for SimConnector {
    type Transport = SimulatedTerminal;

    fn connect(&self) -> Result<Self::Transport, SigmaError> {
        if self.handle.state().fail_connect {
            return Err(SigmaError::Transport("simulated open failure".to_string()));
        }
        Ok(self.handle.transport())
    }
}

/// Transport replaying fixed chunks of bytes, one per read attempt.
///
/// An empty chunk stands for a quiet attempt that uses up its whole timeout.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    chunks: VecDeque<Vec<u8>>,
    /// Every write, in order
    pub written: Vec<Vec<u8>>,
}

impl ReplayTransport {
    /// Replay the given chunks
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            written: Vec::new(),
        }
    }
}

impl Transport for ReplayTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SigmaError> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, SigmaError> {
        match self.chunks.pop_front() {
            Some(chunk) if chunk.is_empty() => {
                std::thread::sleep(timeout);
                Ok(chunk)
            }
            Some(chunk) => Ok(chunk),
            None => {
                std::thread::sleep(timeout.min(SIM_TICK));
                Ok(Vec::new())
            }
        }
    }

    fn close(&mut self) {}
}
