//! Sigma terminal status tool
//!
//! Lists serial ports, queries a terminal's status and optionally brings it
//! back to idle.
//!
//! Usage:
//!   cargo run --example sigma_status -- [OPTIONS] [PORT]
//!
//! Options:
//!   --baud RATE       Baud rate (default: 115200)
//!   --config FILE     Load settings from a JSON file
//!   --recover         Run the idle recovery sequence
//!   --list            Only list serial ports

use sigma_ipp::client::SigmaClient;
use sigma_ipp::config::SigmaConfig;
use sigma_ipp::protocol::list_ports;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = SigmaConfig::default();
    let mut port = None;
    let mut baud = None;
    let mut recover = false;
    let mut list_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--baud" => {
                i += 1;
                baud = args.get(i).and_then(|b| b.parse::<u32>().ok());
            }
            "--config" => {
                i += 1;
                let Some(path) = args.get(i) else {
                    eprintln!("--config needs a file");
                    std::process::exit(2);
                };
                match SigmaConfig::from_json_file(path) {
                    Ok(c) => config = c,
                    Err(e) => {
                        eprintln!("{}", e);
                        std::process::exit(2);
                    }
                }
            }
            "--recover" => recover = true,
            "--list" => list_only = true,
            "--help" | "-h" => {
                println!("Usage: sigma_status [--baud RATE] [--config FILE] [--recover] [--list] [PORT]");
                return;
            }
            other if !other.starts_with('-') => port = Some(other.to_string()),
            other => {
                eprintln!("Unknown option: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }

    println!("Serial ports:");
    for info in list_ports() {
        let usb = info
            .usb_id
            .map(|(vid, pid)| format!("{:04x}:{:04x}", vid, pid))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<10?} {} {}",
            info.name,
            info.kind,
            usb,
            info.product.as_deref().unwrap_or("")
        );
    }
    if list_only {
        return;
    }

    if let Some(port) = port {
        config.device_path = port;
    }
    if let Some(baud) = baud {
        config.baud_rate = baud;
    }

    println!("\nQuerying {} at {} baud", config.device_path, config.baud_rate);
    let client = SigmaClient::new(config);

    match client.get_status() {
        Ok(frame) => {
            println!("Status response:");
            for (key, value) in frame.fields.iter() {
                println!("  {}={}", key, value);
            }
        }
        Err(e) => {
            eprintln!("Status query failed: {}", e);
            std::process::exit(1);
        }
    }

    if recover {
        match client.ensure_idle() {
            Ok(true) => println!("Terminal is idle"),
            Ok(false) => {
                println!("Terminal did not reach idle");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Recovery failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
