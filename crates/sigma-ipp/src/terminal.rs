//! Terminal state machine
//!
//! Status classification and the idle-recovery sequence. A terminal left
//! mid-transaction by a crash, a serial disconnect or a power cycle reports
//! status 20 and rejects every new purchase until the open transaction is
//! completed, cancelled or, as a last resort, reversed.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::protocol::{Exchange, Frame, IppSession, Method, SigmaError, Transport};

/// Terminal is idle, or the request was approved
pub const STATUS_IDLE: i64 = 0;

/// Previous transaction was not finalized
pub const STATUS_NOT_COMPLETED: i64 = 20;

/// Classified `STATUS` value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TerminalStatus {
    /// `0`: idle, approved or ready
    Idle,
    /// `20`: needs recovery before anything else
    NotCompleted,
    /// Any other code: decline, error or busy
    Other(i64),
    /// Present but not a number
    Unrecognized(String),
}

impl TerminalStatus {
    /// Classify the `STATUS` field of a frame, if present
    pub fn of(frame: &Frame) -> Option<Self> {
        let raw = frame.status()?;
        Some(match raw.parse::<i64>() {
            Ok(STATUS_IDLE) => TerminalStatus::Idle,
            Ok(STATUS_NOT_COMPLETED) => TerminalStatus::NotCompleted,
            Ok(code) => TerminalStatus::Other(code),
            Err(_) => TerminalStatus::Unrecognized(raw.to_string()),
        })
    }

    /// Whether the terminal will accept a new purchase
    pub fn is_idle(&self) -> bool {
        matches!(self, TerminalStatus::Idle)
    }

    /// Whether the recovery sequence applies
    pub fn needs_recovery(&self) -> bool {
        matches!(self, TerminalStatus::NotCompleted)
    }
}

/// `true` iff a status frame is present and its `STATUS` is `0`
pub fn is_idle(status: Option<&Frame>) -> bool {
    status.is_some_and(|f| f.status() == Some("0"))
}

/// Completion test for recovery steps: `STATUS` present and `STAGE` either
/// absent or at a terminal value (0, or 6 and above). A final frame also ends
/// the step.
pub fn is_step_complete(frame: &Frame) -> bool {
    if frame.is_final() {
        return true;
    }
    if frame.status().is_none() {
        return false;
    }
    match frame.stage() {
        None => true,
        Some(_) => matches!(frame.stage_code(), Some(stage) if stage == 0 || stage >= 6),
    }
}

/// What an idle check did and how it ended
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdleReport {
    /// Terminal reached idle within the budget
    pub idle: bool,
    /// `STATUS` of the last status response, if any arrived
    pub last_status: Option<String>,
    /// Recovery methods issued, in order
    pub recovery_steps: Vec<Method>,
}

impl<T: Transport> IppSession<T> {
    /// Query terminal status.
    ///
    /// Returns `None` when the terminal doesn't answer within `max_wait`.
    pub fn get_status(&mut self, max_wait: Duration) -> Result<Option<Frame>, SigmaError> {
        let exchange = self.request(Method::GetStatus, &[], max_wait, max_wait, |f| {
            f.status().is_some() || f.is_final()
        })?;
        let frame = exchange.map(|e| e.frame);
        tracing::debug!(status = ?frame.as_ref().and_then(|f| f.status()), "GET_STATUS");
        Ok(frame)
    }

    /// Query status and check it is idle
    pub fn is_idle(&mut self, max_wait: Duration) -> Result<bool, SigmaError> {
        Ok(is_idle(self.get_status(max_wait)?.as_ref()))
    }

    /// Bring the terminal to idle within `max_total_wait`.
    ///
    /// Returns `false` if the budget runs out first.
    pub fn ensure_idle(&mut self, max_total_wait: Duration) -> Result<bool, SigmaError> {
        Ok(self.ensure_idle_report(max_total_wait)?.idle)
    }

    /// [`ensure_idle`](Self::ensure_idle) with details of what was done.
    ///
    /// Status 20 triggers `COMPLETE_TX` then `CANCEL_TX` then a fresh status
    /// check, repeated while time remains. The last quarter of the budget is
    /// held back for a single `REVERSAL`, sent only if the terminal was seen
    /// stuck on status 20. Other non-zero codes are polled, never recovered.
    pub fn ensure_idle_report(
        &mut self,
        max_total_wait: Duration,
    ) -> Result<IdleReport, SigmaError> {
        let _span = tracing::info_span!("ensure_idle", budget_ms = max_total_wait.as_millis() as u64)
            .entered();

        let timeouts = self.timeouts;
        let deadline = Instant::now() + max_total_wait;
        let loop_deadline = deadline - max_total_wait / 4;
        let mut report = IdleReport::default();
        let mut stuck = false;

        while let Some(remaining) = time_left(loop_deadline) {
            let status = self.get_status(remaining.min(timeouts.status_wait()))?;
            record_status(&mut report, status.as_ref());
            if is_idle(status.as_ref()) {
                report.idle = true;
                return Ok(report);
            }

            let classified = status.as_ref().and_then(TerminalStatus::of);
            if classified.as_ref().is_some_and(TerminalStatus::needs_recovery) {
                stuck = true;
                tracing::info!("terminal reports previous transaction not completed; recovering");

                for method in [Method::CompleteTx, Method::CancelTx] {
                    let Some(budget) = time_left(loop_deadline) else {
                        break;
                    };
                    self.recovery_step(method, budget.min(timeouts.recovery_step_wait()), &mut report)?;
                }

                let Some(budget) = time_left(loop_deadline) else {
                    break;
                };
                let status = self.get_status(budget.min(timeouts.status_wait()))?;
                record_status(&mut report, status.as_ref());
                if is_idle(status.as_ref()) {
                    tracing::info!("terminal recovered to idle");
                    report.idle = true;
                    return Ok(report);
                }
                continue;
            }

            if let Some(remaining) = time_left(loop_deadline) {
                std::thread::sleep(remaining.min(timeouts.poll_interval()));
            }
        }

        if stuck {
            if let Some(budget) = time_left(deadline) {
                tracing::warn!("terminal still not idle; sending REVERSAL as last resort");
                let step_budget = (budget / 2).min(timeouts.recovery_step_wait());
                self.recovery_step(Method::Reversal, step_budget, &mut report)?;

                if let Some(budget) = time_left(deadline) {
                    let status = self.get_status(budget.min(timeouts.status_wait()))?;
                    record_status(&mut report, status.as_ref());
                    report.idle = is_idle(status.as_ref());
                }
            }
        }

        if !report.idle {
            tracing::warn!(last_status = ?report.last_status, "terminal did not reach idle");
        }
        Ok(report)
    }

    /// Send one recovery method and wait for it to complete
    fn recovery_step(
        &mut self,
        method: Method,
        budget: Duration,
        report: &mut IdleReport,
    ) -> Result<Option<Exchange>, SigmaError> {
        debug_assert!(method.is_recovery());
        report.recovery_steps.push(method);
        let exchange = self.request(method, &[], budget, budget, is_step_complete)?;
        match &exchange {
            Some(e) => tracing::info!(
                method = %method,
                status = ?e.frame.status(),
                stage = ?e.frame.stage(),
                completed = e.completed,
                "recovery step answered"
            ),
            None => tracing::warn!(method = %method, "recovery step got no response"),
        }
        Ok(exchange)
    }
}

fn record_status(report: &mut IdleReport, status: Option<&Frame>) {
    if let Some(code) = status.and_then(Frame::status) {
        report.last_status = Some(code.to_string());
    }
}

/// Time until `deadline`, or `None` once it has passed
fn time_left(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (!remaining.is_zero()).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    fn frame(lines: &[&str]) -> Frame {
        Frame::decode(&encode_frame(lines).unwrap()).unwrap()
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(TerminalStatus::of(&frame(&["STATUS=0"])), Some(TerminalStatus::Idle));
        assert_eq!(
            TerminalStatus::of(&frame(&["STATUS=20"])),
            Some(TerminalStatus::NotCompleted)
        );
        assert_eq!(TerminalStatus::of(&frame(&["STATUS=5"])), Some(TerminalStatus::Other(5)));
        assert_eq!(
            TerminalStatus::of(&frame(&["STATUS=ERR"])),
            Some(TerminalStatus::Unrecognized("ERR".to_string()))
        );
        assert_eq!(TerminalStatus::of(&frame(&["STAGE=1"])), None);
    }

    #[test]
    fn test_is_idle() {
        assert!(is_idle(Some(&frame(&["STATUS=0"]))));
        assert!(!is_idle(Some(&frame(&["STATUS=20"]))));
        assert!(!is_idle(Some(&frame(&["STAGE=0"]))));
        assert!(!is_idle(None));
    }

    #[test]
    fn test_step_completion() {
        assert!(is_step_complete(&frame(&["STATUS=0", "TIMEOUT=5"])));
        assert!(is_step_complete(&frame(&["STATUS=0", "STAGE=6", "TIMEOUT=5"])));
        assert!(is_step_complete(&frame(&["STATUS=3", "STAGE=0", "TIMEOUT=5"])));
        assert!(!is_step_complete(&frame(&["STATUS=0", "STAGE=3", "TIMEOUT=5"])));
        assert!(!is_step_complete(&frame(&["STAGE=7", "TIMEOUT=5"])));
        assert!(is_step_complete(&frame(&["STAGE=3", "TIMEOUT=0"])));
    }
}
