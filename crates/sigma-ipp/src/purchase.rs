//! Purchase operation
//!
//! Runs one card purchase end to end: make sure the terminal is idle, send
//! `PURCHASE`, wait for the final frame, classify it, and leave the terminal
//! idle for the next customer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::{field, Exchange, Frame, IppSession, Method, SigmaError, Transport};

/// Longest reference the terminal accepts
pub const MAX_REFERENCE_LEN: usize = 64;

/// Stage at which the terminal has asked for a card; rejections from here on
/// are customer or issuer decisions
pub const CARD_STAGE: i64 = 5;

/// How `AMOUNT` is written on the wire.
///
/// Firmware variants disagree, so both are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountFormat {
    /// Integer minor units: `150`
    #[default]
    MinorUnits,
    /// Major and minor units: `1.50`
    Decimal,
}

impl AmountFormat {
    /// Render an amount given in minor units
    pub fn format(&self, amount_minor: u64) -> String {
        match self {
            AmountFormat::MinorUnits => amount_minor.to_string(),
            AmountFormat::Decimal => format!("{}.{:02}", amount_minor / 100, amount_minor % 100),
        }
    }

    /// The other format
    pub fn alternate(&self) -> Self {
        match self {
            AmountFormat::MinorUnits => AmountFormat::Decimal,
            AmountFormat::Decimal => AmountFormat::MinorUnits,
        }
    }
}

/// A purchase to run
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    /// Amount in minor units (pence), must be positive
    pub amount_minor: u64,
    /// ISO 4217 numeric currency code, e.g. `826`
    pub currency: String,
    /// Merchant reference, truncated to 64 characters; empty means none
    pub reference: String,
    /// Override for the "terminal unreachable" budget
    pub first_wait: Option<Duration>,
    /// Override for the "customer still paying" budget
    pub final_wait: Option<Duration>,
    /// First amount format to try
    pub amount_format: AmountFormat,
    /// Retry once with the alternate format after an immediate rejection
    pub retry_alternate_format: bool,
}

impl PurchaseRequest {
    /// Create a request with default budgets and formatting
    pub fn new(amount_minor: u64, currency: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
            reference: reference.into(),
            first_wait: None,
            final_wait: None,
            amount_format: AmountFormat::default(),
            retry_alternate_format: true,
        }
    }

    /// Override both wait budgets
    pub fn with_waits(mut self, first_wait: Duration, final_wait: Duration) -> Self {
        self.first_wait = Some(first_wait);
        self.final_wait = Some(final_wait);
        self
    }

    /// Choose the first amount format
    pub fn with_amount_format(mut self, format: AmountFormat, retry_alternate: bool) -> Self {
        self.amount_format = format;
        self.retry_alternate_format = retry_alternate;
        self
    }

    /// Check the request before anything is sent
    pub fn validate(&self) -> Result<(), SigmaError> {
        if self.amount_minor == 0 {
            return Err(SigmaError::InvalidRequest(
                "amount_minor must be positive".to_string(),
            ));
        }
        let currency = self.currency.trim();
        if currency.is_empty() || !currency.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SigmaError::InvalidRequest(format!(
                "invalid currency {:?}",
                self.currency
            )));
        }
        if self.reference.chars().any(|c| c.is_control()) {
            return Err(SigmaError::InvalidRequest(
                "reference contains control characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Reference as sent on the wire
    pub fn wire_reference(&self) -> Option<String> {
        let reference: String = self.reference.trim().chars().take(MAX_REFERENCE_LEN).collect();
        (!reference.is_empty()).then_some(reference)
    }

    fn wire_fields(&self, format: AmountFormat) -> Vec<String> {
        let mut fields = vec![
            field("AMOUNT", format.format(self.amount_minor)),
            field("CURRENCY", self.currency.trim()),
        ];
        if let Some(reference) = self.wire_reference() {
            fields.push(field("REFERENCE", reference));
        }
        fields
    }
}

/// Outcome of a purchase the terminal finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseResult {
    approved: bool,
    status: String,
    stage: String,
    raw_fields: BTreeMap<String, String>,
    receipt: Option<String>,
    transaction_id: Option<String>,
    auth_code: Option<String>,
    amount_format: AmountFormat,
}

impl PurchaseResult {
    /// Build a result from the final frame of a purchase
    pub fn from_frame(frame: &Frame, amount_format: AmountFormat) -> Self {
        let non_empty = |key: &str| {
            frame
                .get(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            approved: classify_approval(frame),
            status: frame.status().unwrap_or_default().to_string(),
            stage: frame.stage().unwrap_or_default().to_string(),
            raw_fields: frame.fields.as_map().clone(),
            receipt: frame.get("RECEIPT").map(str::to_string).filter(|r| !r.is_empty()),
            transaction_id: non_empty("TXID").or_else(|| non_empty("RRN")),
            auth_code: non_empty("AUTH_CODE"),
            amount_format,
        }
    }

    /// Whether the payment went through
    pub fn approved(&self) -> bool {
        self.approved
    }

    /// `STATUS` of the final frame
    pub fn status(&self) -> &str {
        &self.status
    }

    /// `STAGE` of the final frame
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Every field of the final frame
    pub fn raw_fields(&self) -> &BTreeMap<String, String> {
        &self.raw_fields
    }

    /// Receipt text, if the terminal sent one
    pub fn receipt(&self) -> Option<&str> {
        self.receipt.as_deref()
    }

    /// `TXID`, falling back to `RRN`
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// `AUTH_CODE`, if present
    pub fn auth_code(&self) -> Option<&str> {
        self.auth_code.as_deref()
    }

    /// Amount format the terminal accepted
    pub fn amount_format(&self) -> AmountFormat {
        self.amount_format
    }

    /// Turn a decline into [`SigmaError::Rejected`]
    pub fn into_approved(self) -> Result<Self, SigmaError> {
        if self.approved {
            Ok(self)
        } else {
            Err(SigmaError::Rejected {
                status: self.status,
                stage: self.stage,
                fields: self.raw_fields,
            })
        }
    }
}

/// Read an explicit approval marker.
///
/// `APPROVED` is checked first, then `RESULT`, then `APPROVAL`. Unrecognized
/// values are skipped.
pub fn explicit_approval(frame: &Frame) -> Option<bool> {
    ["APPROVED", "RESULT", "APPROVAL"]
        .into_iter()
        .find_map(|key| frame.get(key).and_then(|value| parse_marker(key, value)))
}

fn parse_marker(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "APPROVED" | "SUCCESS" | "OK" | "Y" | "YES" | "TRUE" => Some(true),
        "DECLINED" | "DENIED" | "REJECTED" | "FAILED" | "ERROR" | "CANCELLED" | "CANCELED"
        | "N" | "NO" | "FALSE" => Some(false),
        "1" if key == "APPROVED" => Some(true),
        "0" if key == "APPROVED" => Some(false),
        _ => None,
    }
}

/// Explicit marker if present, else `STATUS == "0"`
pub fn classify_approval(frame: &Frame) -> bool {
    explicit_approval(frame).unwrap_or_else(|| frame.status() == Some("0"))
}

/// A lone non-zero frame before the card stage, with no explicit decline,
/// is how firmware refuses an amount string it can't parse
fn is_format_rejection(exchange: &Exchange) -> bool {
    let frame = &exchange.frame;
    exchange.frames == 1
        && frame.is_rejection()
        && explicit_approval(frame) != Some(false)
        && frame.stage_code().map_or(true, |stage| stage < CARD_STAGE)
}

impl<T: Transport> IppSession<T> {
    /// Run a purchase.
    ///
    /// Fails with [`SigmaError::TerminalNotReady`] if the terminal can't be
    /// made idle first, and with [`SigmaError::Timeout`] if the terminal
    /// doesn't answer or never reaches a final frame. After a timeout the
    /// card may or may not have been charged.
    pub fn purchase(&mut self, request: &PurchaseRequest) -> Result<PurchaseResult, SigmaError> {
        request.validate()?;
        let _span = tracing::info_span!(
            "purchase",
            amount_minor = request.amount_minor,
            currency = %request.currency
        )
        .entered();

        let timeouts = self.timeouts;
        let ready = self.ensure_idle_report(timeouts.ready_wait())?;
        if !ready.idle {
            return Err(SigmaError::TerminalNotReady {
                last_status: ready.last_status,
            });
        }

        let first_wait = request.first_wait.unwrap_or_else(|| timeouts.first_wait());
        let final_wait = request.final_wait.unwrap_or_else(|| timeouts.final_wait());

        let mut format = request.amount_format;
        let Some(mut exchange) = self.send_purchase(request, format, first_wait, final_wait)? else {
            return Err(SigmaError::Timeout {
                operation: Method::Purchase.to_string(),
                last_fields: None,
            });
        };

        if request.retry_alternate_format && is_format_rejection(&exchange) {
            let alternate = format.alternate();
            tracing::warn!(
                status = ?exchange.frame.status(),
                "amount rejected as {:?}; retrying as {:?}",
                format,
                alternate
            );
            if self.ensure_idle(timeouts.post_idle_wait())? {
                // A second PURCHASE is out; silence now means the outcome is unknown
                let Some(retry) = self.send_purchase(request, alternate, first_wait, final_wait)? else {
                    tracing::warn!("retried purchase got no response");
                    return Err(SigmaError::Timeout {
                        operation: Method::Purchase.to_string(),
                        last_fields: None,
                    });
                };
                format = alternate;
                exchange = retry;
            }
        }

        let outcome = if exchange.completed {
            let result = PurchaseResult::from_frame(&exchange.frame, format);
            tracing::info!(
                approved = result.approved(),
                status = result.status(),
                stage = result.stage(),
                "purchase finished"
            );
            Ok(result)
        } else {
            tracing::warn!(frames = exchange.frames, "purchase never reached a final frame");
            Err(SigmaError::Timeout {
                operation: Method::Purchase.to_string(),
                last_fields: Some(exchange.frame.fields.as_map().clone()),
            })
        };

        self.restore_idle(timeouts.post_idle_wait());
        outcome
    }

    fn send_purchase(
        &mut self,
        request: &PurchaseRequest,
        format: AmountFormat,
        first_wait: Duration,
        final_wait: Duration,
    ) -> Result<Option<Exchange>, SigmaError> {
        self.request(
            Method::Purchase,
            &request.wire_fields(format),
            first_wait,
            final_wait,
            Frame::is_final,
        )
    }

    /// Best-effort idle restore; the outcome is only logged
    fn restore_idle(&mut self, budget: Duration) {
        match self.ensure_idle(budget) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("terminal not idle after purchase"),
            Err(e) => tracing::warn!("restoring idle after purchase failed: {}", e),
        }
    }
}
