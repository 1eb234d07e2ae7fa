//! Terminal client
//!
//! [`SigmaClient`] is the entry point for applications. Every operation opens
//! the device, runs under the terminal guard, and closes the device again, so
//! nothing is held between customers and a replugged terminal is picked up
//! on the next call.

use crate::config::SigmaConfig;
use crate::guard::TerminalGuard;
use crate::protocol::{existing_candidates, list_ports, Frame, IppSession, Method, SerialTransport, SigmaError, Transport};
use crate::purchase::{PurchaseRequest, PurchaseResult};

/// Opens a transport to the terminal
pub trait Connector: Send + Sync {
    /// Transport type produced
    type Transport: Transport;

    /// Open a fresh transport
    fn connect(&self) -> Result<Self::Transport, SigmaError>;
}

/// Opens the first configured serial device that exists and accepts the open
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SigmaConfig,
}

impl SerialConnector {
    /// Connector for the devices named in `config`
    pub fn new(config: SigmaConfig) -> Self {
        Self { config }
    }
}

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn connect(&self) -> Result<SerialTransport, SigmaError> {
        let wanted = self.config.port_candidates();
        let candidates = existing_candidates(wanted.iter().copied());
        if candidates.is_empty() {
            let present: Vec<String> = list_ports().into_iter().map(|p| p.name).collect();
            tracing::warn!(wanted = ?wanted, present = ?present, "no terminal device found");
            return Err(SigmaError::PortNotFound(wanted.join(", ")));
        }

        let mut last_error = None;
        for path in &candidates {
            match SerialTransport::open(path, self.config.baud_rate, self.config.read_timeout()) {
                Ok(transport) => {
                    tracing::info!(port = %path, baud = self.config.baud_rate, "terminal connected");
                    return Ok(transport);
                }
                Err(e) => {
                    tracing::warn!(port = %path, "open failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SigmaError::PortNotFound(wanted.join(", "))))
    }
}

/// Client for one Sigma terminal
pub struct SigmaClient<C: Connector = SerialConnector> {
    config: SigmaConfig,
    connector: C,
    guard: TerminalGuard,
}

impl SigmaClient<SerialConnector> {
    /// Client talking to the serial device named in `config`
    pub fn new(config: SigmaConfig) -> Self {
        let connector = SerialConnector::new(config.clone());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> SigmaClient<C> {
    /// Client using a custom connector
    pub fn with_connector(config: SigmaConfig, connector: C) -> Self {
        let guard = match &config.lock_file {
            Some(path) => TerminalGuard::with_lock_file(path),
            None => TerminalGuard::new(),
        };
        Self {
            config,
            connector,
            guard,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &SigmaConfig {
        &self.config
    }

    /// Guard serializing access to the terminal
    pub fn guard(&self) -> &TerminalGuard {
        &self.guard
    }

    /// Connector in use
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run a purchase for `amount_minor` pence.
    ///
    /// An empty `currency` uses the configured default. A decline is returned
    /// as `Ok` with `approved() == false`; use
    /// [`PurchaseResult::into_approved`] to turn it into an error.
    pub fn purchase(
        &self,
        amount_minor: u64,
        currency: &str,
        reference: &str,
    ) -> Result<PurchaseResult, SigmaError> {
        let currency = match currency.trim() {
            "" => self.config.default_currency.as_str(),
            c => c,
        };
        let request = PurchaseRequest::new(amount_minor, currency, reference).with_amount_format(
            self.config.amount_format,
            self.config.retry_alternate_amount_format,
        );
        self.purchase_with(&request)
    }

    /// Run a fully specified purchase
    pub fn purchase_with(&self, request: &PurchaseRequest) -> Result<PurchaseResult, SigmaError> {
        request.validate()?;
        let _token = self.guard.acquire(self.config.acquire_timeout())?;
        self.with_session(|session| session.purchase(request))
    }

    /// Query the terminal's status
    pub fn get_status(&self) -> Result<Frame, SigmaError> {
        let _token = self.guard.acquire(self.config.acquire_timeout())?;
        let wait = self.config.timeouts.status_wait();
        self.with_session(|session| session.get_status(wait))?
            .ok_or_else(|| SigmaError::Timeout {
                operation: Method::GetStatus.to_string(),
                last_fields: None,
            })
    }

    /// Bring the terminal to idle within the configured ready budget
    pub fn ensure_idle(&self) -> Result<bool, SigmaError> {
        let _token = self.guard.acquire(self.config.acquire_timeout())?;
        let budget = self.config.timeouts.ready_wait();
        self.with_session(|session| session.ensure_idle(budget))
    }

    /// Best-effort idle check ahead of a customer.
    ///
    /// Returns `Ok(None)` without touching the device when another operation
    /// holds the terminal.
    pub fn warmup(&self) -> Result<Option<bool>, SigmaError> {
        let _span = tracing::info_span!("warmup").entered();
        let _token = match self.guard.acquire(self.config.warmup_acquire_timeout()) {
            Ok(token) => token,
            Err(SigmaError::Busy { waited }) => {
                tracing::debug!("terminal busy after {:?}; skipping warmup", waited);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let budget = self.config.timeouts.post_idle_wait();
        let idle = self.with_session(|session| session.ensure_idle(budget))?;
        tracing::info!(idle, "warmup finished");
        Ok(Some(idle))
    }

    /// Open a session, run `f`, and close the session whatever happens
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut IppSession<C::Transport>) -> Result<R, SigmaError>,
    ) -> Result<R, SigmaError> {
        let transport = self.connector.connect()?;
        let mut session = IppSession::from_config(transport, &self.config);
        let result = f(&mut session);
        session.close();
        result
    }
}

/// Budgets short enough for tests against a simulated terminal
#[cfg(test)]
pub(crate) fn fast_config() -> SigmaConfig {
    let mut config = SigmaConfig::default();
    config.read_timeout_ms = 5;
    config.timeouts.first_wait_ms = 200;
    config.timeouts.final_wait_ms = 500;
    config.timeouts.ready_wait_ms = 400;
    config.timeouts.post_idle_wait_ms = 300;
    config.timeouts.status_wait_ms = 100;
    config.timeouts.recovery_step_wait_ms = 100;
    config.timeouts.poll_interval_ms = 5;
    config.acquire_timeout_ms = 100;
    config.warmup_acquire_timeout_ms = 10;
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConnector, SimHandle};

    #[test]
    fn test_missing_device_is_port_not_found() {
        let mut config = SigmaConfig::default();
        config.device_path = "/nonexistent/sigma".to_string();
        config.fallback_paths = vec!["/nonexistent/ttyACM9".to_string()];
        let client = SigmaClient::new(config);
        assert!(matches!(client.get_status(), Err(SigmaError::PortNotFound(_))));
    }

    #[test]
    fn test_status_over_simulated_terminal() {
        let handle = SimHandle::new();
        let client = SigmaClient::with_connector(fast_config(), SimConnector::new(handle.clone()));
        let frame = client.get_status().unwrap();
        assert_eq!(frame.status(), Some("0"));
        assert_eq!(handle.state().open_transports, 0);
    }

    #[test]
    fn test_warmup_skips_when_busy() {
        let handle = SimHandle::new();
        let client = SigmaClient::with_connector(fast_config(), SimConnector::new(handle.clone()));
        let _token = client.guard().try_acquire().unwrap();
        assert_eq!(client.warmup().unwrap(), None);
        assert_eq!(handle.state().connects, 0);
    }

    #[test]
    fn test_empty_currency_uses_default() {
        let handle = SimHandle::new();
        let client = SigmaClient::with_connector(fast_config(), SimConnector::new(handle.clone()));
        let result = client.purchase(150, "", "ORD-1").unwrap();
        assert!(result.approved());
        let state = handle.state();
        let purchase = state.requests_for(Method::Purchase);
        assert_eq!(purchase[0].get("CURRENCY"), Some("826"));
    }
}
