//! Serial port handling
//!
//! Low-level serial port access and device discovery for the terminal.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{SigmaError, DEFAULT_BAUD_RATE};

/// How a device node relates to the terminal, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortKind {
    /// Stable udev link such as `/dev/sigma`, survives replugging
    StableLink,
    /// CDC-ACM node, how the terminal enumerates natively
    CdcAcm,
    /// USB-serial adapter node
    UsbSerial,
    /// Anything else the OS reports
    Other,
}

impl PortKind {
    /// Classify a device path by its basename
    pub fn of(name: &str) -> Self {
        let basename = name.rsplit('/').next().unwrap_or(name);
        if basename.starts_with("sigma") {
            PortKind::StableLink
        } else if basename.starts_with("ttyACM") {
            PortKind::CdcAcm
        } else if basename.starts_with("ttyUSB") {
            PortKind::UsbSerial
        } else {
            PortKind::Other
        }
    }
}

/// A serial device that might be the terminal
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Device path (e.g., "/dev/sigma")
    pub name: String,

    /// Preference class of the path
    pub kind: PortKind,

    /// USB vendor and product ID, when the OS reports them
    pub usb_id: Option<(u16, u16)>,

    /// Product string, when the OS reports it
    pub product: Option<String>,
}

impl PortInfo {
    fn from_path(name: String) -> Self {
        Self {
            kind: PortKind::of(&name),
            name,
            usb_id: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self::from_path(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.usb_id = Some((usb.vid, usb.pid));
            port.product = usb.product;
        }
        port
    }
}

/// Preference order: kind first, then the node number so ttyACM2 sorts before ttyACM10
fn port_rank(port: &PortInfo) -> (PortKind, usize, &str) {
    let basename = port.name.rsplit('/').next().unwrap_or(&port.name);
    let digits = basename.trim_start_matches(|c: char| !c.is_ascii_digit());
    let number = digits.parse::<usize>().unwrap_or(0);
    (port.kind, number, basename)
}

/// Devices that could be the terminal, most likely first.
///
/// The `/dev` scan also picks up `sigma*` udev links, which the OS
/// enumeration never reports.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let Some(fname) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let full = format!("/dev/{}", fname);
            if PortKind::of(&full) != PortKind::Other {
                map.entry(full.clone())
                    .or_insert_with(|| PortInfo::from_path(full));
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by(|a, b| port_rank(a).cmp(&port_rank(b)));
    ports
}

/// Filter candidate device paths down to those that exist, without duplicates.
///
/// Symlinks such as `/dev/sigma` are followed, so a dangling link is skipped.
pub fn existing_candidates<'a, I>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = Vec::new();
    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() || seen.iter().any(|s: &String| s == candidate) {
            continue;
        }
        if Path::new(candidate).exists() {
            seen.push(candidate.to_string());
        }
    }
    seen
}

/// Open a serial port
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, SigmaError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    serialport::new(name, baud)
        .timeout(read_timeout)
        .open()
        .map_err(|e| SigmaError::Transport(format!("cannot open {}: {}", name, e)))
}

/// Configure a serial port for the terminal.
///
/// Every step is best-effort: some USB-CDC adapters reject framing or
/// line-state control, and none of it is needed for the link to work.
pub fn configure_port(port: &mut dyn SerialPort) {
    let steps: [(&str, serialport::Result<()>); 4] = [
        ("data bits", port.set_data_bits(serialport::DataBits::Eight)),
        ("parity", port.set_parity(serialport::Parity::None)),
        ("stop bits", port.set_stop_bits(serialport::StopBits::One)),
        (
            "flow control",
            port.set_flow_control(serialport::FlowControl::None),
        ),
    ];
    for (what, result) in steps {
        if let Err(e) = result {
            tracing::debug!("configure_port: failed to set {}: {} (continuing)", what, e);
        }
    }

    // DTR/RTS high wakes some terminals after enumeration
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("configure_port: failed to set RTS high: {} (continuing)", e);
    }
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), SigmaError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| SigmaError::Transport(e.to_string()))
}
