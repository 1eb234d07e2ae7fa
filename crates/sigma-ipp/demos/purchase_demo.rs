//! Purchase walkthrough against the simulated terminal
//!
//! Runs a stuck-terminal recovery, an approval, a decline and an amount
//! format retry without any hardware attached.
//!
//! Usage:
//!   RUST_LOG=sigma_ipp=debug cargo run --example purchase_demo

use std::time::Duration;

use sigma_ipp::client::SigmaClient;
use sigma_ipp::config::SigmaConfig;
use sigma_ipp::purchase::AmountFormat;
use sigma_ipp::sim::{PurchaseBehavior, RecoveryRule, SimConnector, SimHandle};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = SigmaConfig::default();
    config.timeouts.first_wait_ms = 2_000;
    config.timeouts.final_wait_ms = 5_000;
    config.timeouts.ready_wait_ms = 2_000;
    config.timeouts.post_idle_wait_ms = 1_000;
    config.timeouts.status_wait_ms = 500;
    config.timeouts.recovery_step_wait_ms = 500;

    let handle = SimHandle::stuck(RecoveryRule::CompleteThenCancel);
    handle.update(|s| s.frame_interval = Duration::from_millis(300));
    let client = SigmaClient::with_connector(config, SimConnector::new(handle.clone()));

    println!("=== Purchase on a terminal left mid-transaction ===");
    report(client.purchase(150, "826", "DEMO-1"));

    println!("\n=== Card declined ===");
    handle.update(|s| s.purchase = PurchaseBehavior::Decline { status: 5, stage: 5 });
    report(client.purchase(990, "826", "DEMO-2"));

    println!("\n=== Firmware wanting decimal amounts ===");
    handle.update(|s| s.purchase = PurchaseBehavior::RequireFormat(AmountFormat::Decimal));
    report(client.purchase(1_250, "", "DEMO-3"));

    println!("\nRequests seen by the terminal:");
    for method in handle.methods() {
        println!("  {}", method);
    }
}

fn report(outcome: Result<sigma_ipp::purchase::PurchaseResult, sigma_ipp::protocol::SigmaError>) {
    match outcome {
        Ok(result) if result.approved() => println!(
            "APPROVED txid={} auth={} (amount sent as {:?})",
            result.transaction_id().unwrap_or("-"),
            result.auth_code().unwrap_or("-"),
            result.amount_format()
        ),
        Ok(result) => println!(
            "DECLINED status={} stage={}",
            result.status(),
            result.stage()
        ),
        Err(e) => println!("FAILED: {}", e),
    }
}
