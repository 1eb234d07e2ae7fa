//! Client configuration
//!
//! All settings are plain scalars with defaults suited to a Sigma on a kiosk.
//! A [`SigmaConfig`] can be built in code, loaded from a JSON file, or pulled
//! out of the kiosk's remote configuration document.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{SigmaError, DEFAULT_BAUD_RATE, DEFAULT_PROTOCOL_VERSION};
use crate::purchase::AmountFormat;

/// Stable udev symlink for the terminal
pub const DEFAULT_DEVICE_PATH: &str = "/dev/sigma";

/// ISO 4217 numeric code for GBP
pub const DEFAULT_CURRENCY: &str = "826";

/// Wait budgets, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long PURCHASE may go without any answer ("terminal unreachable")
    pub first_wait_ms: u64,
    /// How long PURCHASE may take to reach its final frame (card, PIN)
    pub final_wait_ms: u64,
    /// EnsureIdle budget before a purchase
    pub ready_wait_ms: u64,
    /// EnsureIdle budget after a purchase
    pub post_idle_wait_ms: u64,
    /// Budget for a single GET_STATUS
    pub status_wait_ms: u64,
    /// Budget for each COMPLETE_TX / CANCEL_TX / REVERSAL
    pub recovery_step_wait_ms: u64,
    /// Pause between status polls while waiting for idle
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            first_wait_ms: 25_000,
            final_wait_ms: 180_000,
            ready_wait_ms: 30_000,
            post_idle_wait_ms: 10_000,
            status_wait_ms: 5_000,
            recovery_step_wait_ms: 60_000,
            poll_interval_ms: 250,
        }
    }
}

impl Timeouts {
    /// `first_wait_ms` as a duration
    pub fn first_wait(&self) -> Duration {
        Duration::from_millis(self.first_wait_ms)
    }

    /// `final_wait_ms` as a duration
    pub fn final_wait(&self) -> Duration {
        Duration::from_millis(self.final_wait_ms)
    }

    /// `ready_wait_ms` as a duration
    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    /// `post_idle_wait_ms` as a duration
    pub fn post_idle_wait(&self) -> Duration {
        Duration::from_millis(self.post_idle_wait_ms)
    }

    /// `status_wait_ms` as a duration
    pub fn status_wait(&self) -> Duration {
        Duration::from_millis(self.status_wait_ms)
    }

    /// `recovery_step_wait_ms` as a duration
    pub fn recovery_step_wait(&self) -> Duration {
        Duration::from_millis(self.recovery_step_wait_ms)
    }

    /// `poll_interval_ms` as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Terminal client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmaConfig {
    /// Preferred device node
    pub device_path: String,
    /// Nodes tried, in order, when the preferred one is missing or fails to open
    pub fallback_paths: Vec<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Value sent in the `VERSION` field
    pub protocol_version: String,
    /// Upper bound for a single read attempt, in milliseconds
    pub read_timeout_ms: u64,
    /// Wait budgets
    #[serde(flatten)]
    pub timeouts: Timeouts,
    /// How long a purchase waits for another operation to release the terminal
    pub acquire_timeout_ms: u64,
    /// How long a warmup waits before skipping itself
    pub warmup_acquire_timeout_ms: u64,
    /// Lock file shared with other processes driving the same terminal
    pub lock_file: Option<PathBuf>,
    /// Currency sent when a purchase doesn't name one
    pub default_currency: String,
    /// First amount encoding tried on PURCHASE
    pub amount_format: AmountFormat,
    /// Retry once with the other amount encoding after an immediate rejection
    pub retry_alternate_amount_format: bool,
}

impl Default for SigmaConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            fallback_paths: vec!["/dev/ttyACM0".to_string(), "/dev/ttyUSB0".to_string()],
            baud_rate: DEFAULT_BAUD_RATE,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            read_timeout_ms: 200,
            timeouts: Timeouts::default(),
            acquire_timeout_ms: 2_000,
            warmup_acquire_timeout_ms: 50,
            lock_file: None,
            default_currency: DEFAULT_CURRENCY.to_string(),
            amount_format: AmountFormat::MinorUnits,
            retry_alternate_amount_format: true,
        }
    }
}

/// `payment.sigma` section of the kiosk's remote config
#[derive(Debug, Default, Deserialize)]
struct KioskSigmaSection {
    #[serde(default)]
    usb_path: Option<String>,
    #[serde(default)]
    baud: Option<serde_json::Value>,
}

impl SigmaConfig {
    /// Parse a JSON document; missing keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, SigmaError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SigmaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SigmaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SigmaError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Apply the `payment.sigma` section of a kiosk config document.
    ///
    /// A non-empty `usb_path` becomes the device path and the previous device
    /// is tried right after it. `baud` may be a number or a numeric string and
    /// is ignored when unparseable.
    pub fn from_kiosk_config(document: &serde_json::Value) -> Self {
        let mut config = Self::default();

        let section = document
            .get("payment")
            .and_then(|p| p.get("sigma"))
            .cloned()
            .and_then(|s| serde_json::from_value::<KioskSigmaSection>(s).ok())
            .unwrap_or_default();

        if let Some(path) = section.usb_path.map(|p| p.trim().to_string()) {
            if !path.is_empty() && path != config.device_path {
                // The default device stays reachable as the first fallback
                let previous = std::mem::replace(&mut config.device_path, path);
                if !config.fallback_paths.contains(&previous) {
                    config.fallback_paths.insert(0, previous);
                }
            }
        }

        let baud = match section.baud {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        if let Some(baud) = baud.and_then(|b| u32::try_from(b).ok()).filter(|b| *b > 0) {
            config.baud_rate = baud;
        }

        config
    }

    /// Reject settings that would make every operation fail
    pub fn validate(&self) -> Result<(), SigmaError> {
        if self.baud_rate == 0 {
            return Err(SigmaError::Config("baud_rate must be positive".to_string()));
        }
        if self.read_timeout_ms == 0 {
            return Err(SigmaError::Config(
                "read_timeout_ms must be positive".to_string(),
            ));
        }
        if self.protocol_version.trim().is_empty() {
            return Err(SigmaError::Config(
                "protocol_version must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Device nodes to try, preferred first, without duplicates
    pub fn port_candidates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for path in std::iter::once(&self.device_path).chain(self.fallback_paths.iter()) {
            let path = path.trim();
            if !path.is_empty() && !out.contains(&path) {
                out.push(path);
            }
        }
        out
    }

    /// `read_timeout_ms` as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// `acquire_timeout_ms` as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// `warmup_acquire_timeout_ms` as a duration
    pub fn warmup_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_acquire_timeout_ms)
    }
}
