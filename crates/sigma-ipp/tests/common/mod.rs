//! Shared helpers for integration tests

#![allow(dead_code)]

use std::time::Duration;

use sigma_ipp::config::{SigmaConfig, Timeouts};
use sigma_ipp::protocol::{encode_frame, IppSession, Transport};
use sigma_ipp::sim::{SimConnector, SimHandle};
use sigma_ipp::client::SigmaClient;

/// Install a test-friendly subscriber; `RUST_LOG=sigma_ipp=debug` shows frames
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Budgets in milliseconds so every scenario finishes quickly
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        first_wait_ms: 300,
        final_wait_ms: 1_000,
        ready_wait_ms: 400,
        post_idle_wait_ms: 300,
        status_wait_ms: 100,
        recovery_step_wait_ms: 100,
        poll_interval_ms: 5,
    }
}

pub fn fast_config() -> SigmaConfig {
    SigmaConfig {
        read_timeout_ms: 5,
        timeouts: fast_timeouts(),
        acquire_timeout_ms: 2_000,
        warmup_acquire_timeout_ms: 10,
        ..SigmaConfig::default()
    }
}

pub fn sim_client(handle: &SimHandle) -> SigmaClient<SimConnector> {
    SigmaClient::with_connector(fast_config(), SimConnector::new(handle.clone()))
}

pub fn session<T: Transport>(transport: T) -> IppSession<T> {
    IppSession::new(transport, "202", Duration::from_millis(5), fast_timeouts())
}

/// Encoded response frame echoing `method` and `sid`
pub fn reply(method: &str, sid: &str, extra: &[&str]) -> Vec<u8> {
    let mut lines = vec![format!("METHOD={}", method), format!("SID={}", sid)];
    lines.extend(extra.iter().map(|s| s.to_string()));
    encode_frame(&lines).expect("encodable reply")
}
