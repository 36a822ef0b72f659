//! Line-oriented serial link to the tester.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort, SerialPortType};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, TesterError, TransportError};
use crate::protocol::Command;

/// A half-duplex, newline-framed connection.
pub trait Transport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next non-empty line.
    ///
    /// `Ok(None)` means nothing arrived in time; that is an expected outcome,
    /// not a fault.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Throws away everything received but not yet read, so a reply that
    /// arrived after its command timed out cannot answer the next one.
    /// Returns the complete lines that were dropped.
    fn discard_input(&mut self) -> Vec<String>;

    /// Drops and re-establishes the connection.
    fn reconnect(&mut self) -> Result<(), ConnectError>;

    fn close(&mut self);

    /// Port name or other label for logs and status.
    fn describe(&self) -> String;
}

/// Reads lines until one starts with a prefix `command` expects.
///
/// Unrelated lines (debug chatter, progress messages) are skipped. An
/// `ERROR:` line ends the exchange at once.
pub fn read_until_prefix<T: Transport + ?Sized>(
    transport: &mut T,
    command: Command,
    timeout: Duration,
) -> Result<String, TesterError> {
    let prefixes = command.response_prefixes();
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TesterError::NoResponse { command, timeout });
        }

        let Some(line) = transport.read_line(remaining)? else {
            return Err(TesterError::NoResponse { command, timeout });
        };

        if prefixes.iter().any(|prefix| line.starts_with(prefix)) {
            return Ok(line);
        }
        if let Some(message) = line.strip_prefix("ERROR:") {
            warn!(%command, device_error = message, "tester reported error");
            return Err(TesterError::Device(message.to_string()));
        }
        debug!(%command, %line, "skipping unrelated line");
    }
}

/// A serial port that looks like a tester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub port_name: String,
    pub description: String,
}

const KNOWN_VENDOR_IDS: [u16; 4] = [
    0x2341, // Arduino
    0x2A03, // Arduino (clone boards)
    0x1A86, // WCH CH340/CH341
    0x0403, // FTDI
];

const KNOWN_DESCRIPTORS: [&str; 5] = ["arduino", "ch340", "ch341", "ftdi", "atmega"];

const KNOWN_PATH_PATTERNS: [&str; 2] = ["ttyACM", "ttyUSB"];

/// Heuristic match on whatever the OS tells us about a port.
pub fn matches_known_device(port_name: &str, vendor_id: Option<u16>, descriptor: &str) -> bool {
    if vendor_id.is_some_and(|vid| KNOWN_VENDOR_IDS.contains(&vid)) {
        return true;
    }
    let descriptor = descriptor.to_lowercase();
    if KNOWN_DESCRIPTORS.iter().any(|known| descriptor.contains(known)) {
        return true;
    }
    KNOWN_PATH_PATTERNS.iter().any(|pattern| port_name.contains(pattern))
}

fn describe_port_type(port_type: &SerialPortType) -> (Option<u16>, String) {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let text = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (Some(usb.vid), text)
        }
        SerialPortType::PciPort => (None, "PCI".to_string()),
        SerialPortType::BluetoothPort => (None, "Bluetooth".to_string()),
        SerialPortType::Unknown => (None, String::new()),
    }
}

/// Enumerates serial ports and keeps the ones matching the tester heuristic.
pub fn list_candidate_ports() -> Result<Vec<PortCandidate>, ConnectError> {
    let ports = serialport::available_ports().map_err(ConnectError::Enumerate)?;
    let candidates = ports
        .into_iter()
        .filter_map(|port| {
            let (vendor_id, description) = describe_port_type(&port.port_type);
            matches_known_device(&port.port_name, vendor_id, &description).then(|| PortCandidate {
                port_name: port.port_name,
                description,
            })
        })
        .collect();
    Ok(candidates)
}

pub fn discover_port() -> Result<String, ConnectError> {
    let candidate = list_candidate_ports()?
        .into_iter()
        .next()
        .ok_or(ConnectError::NoDeviceFound)?;
    info!(port = %candidate.port_name, description = %candidate.description, "found cable tester");
    Ok(candidate.port_name)
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Default read timeout; per-call timeouts override it temporarily.
    pub timeout: Duration,
    /// Grace period after open while the board reboots.
    pub settle_time: Duration,
}

pub struct SerialTransport {
    port_name: String,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    read_buf: Vec<u8>,
}

impl SerialTransport {
    /// Opens `port`, or the first discovered tester when `port` is `None`.
    pub fn connect(port: Option<&str>, settings: SerialSettings) -> Result<Self, ConnectError> {
        let port_name = match port {
            Some(name) => name.to_string(),
            None => discover_port()?,
        };
        let handle = open_port(&port_name, &settings)?;

        Ok(Self {
            port_name,
            settings,
            port: Some(handle),
            read_buf: Vec::with_capacity(128),
        })
    }

    /// Pops the first complete line out of the read buffer.
    fn take_line(&mut self) -> Option<String> {
        let end = self.read_buf.iter().position(|&byte| byte == b'\n')?;
        let raw: Vec<u8> = self.read_buf.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn read_line_until(&mut self, deadline: Instant) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                debug!(port = %self.port_name, %line, "received");
                return Ok(Some(line));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;
            port.set_timeout(deadline - now)?;
            let mut chunk = [0u8; 64];
            match port.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(read) => self.read_buf.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(map_io_error(e)),
            }
        }
    }
}

fn open_port(port_name: &str, settings: &SerialSettings) -> Result<Box<dyn SerialPort>, ConnectError> {
    info!(port = %port_name, baud_rate = settings.baud_rate, "opening cable tester port");
    let handle = serialport::new(port_name, settings.baud_rate)
        .timeout(settings.timeout)
        .open()
        .map_err(|source| ConnectError::OpenFailed {
            port: port_name.to_string(),
            source,
        })?;

    // Opening the port resets the board; wait it out and drop the boot banner.
    if !settings.settle_time.is_zero() {
        debug!(settle_ms = settings.settle_time.as_millis() as u64, "waiting for tester to settle");
        thread::sleep(settings.settle_time);
    }
    if let Err(e) = handle.clear(ClearBuffer::Input) {
        warn!(port = %port_name, error = %e, "could not clear stale input");
    }
    Ok(handle)
}

fn map_io_error(error: io::Error) -> TransportError {
    match error.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset => TransportError::Disconnected,
        _ => TransportError::Io(error),
    }
}

impl Transport for SerialTransport {
    fn discard_input(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        while let Some(line) = self.take_line() {
            if !line.is_empty() {
                dropped.push(line);
            }
        }
        self.read_buf.clear();

        if let Some(port) = self.port.as_mut() {
            match port.bytes_to_read() {
                Ok(0) => {}
                Ok(pending) => debug!(port = %self.port_name, pending, "clearing unread input"),
                Err(e) => warn!(port = %self.port_name, error = %e, "could not query unread input"),
            }
            if let Err(e) = port.clear(ClearBuffer::Input) {
                warn!(port = %self.port_name, error = %e, "could not clear stale input");
            }
        }
        dropped
    }

    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;
        port.write_all(format!("{line}\n").as_bytes()).map_err(map_io_error)?;
        port.flush().map_err(map_io_error)?;
        debug!(port = %self.port_name, %line, "sent");
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let result = self.read_line_until(Instant::now() + timeout);

        // The override only lasts for this call.
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.set_timeout(self.settings.timeout) {
                warn!(port = %self.port_name, error = %e, "could not restore default timeout");
            }
        }
        result
    }

    fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.port = None;
        self.read_buf.clear();
        self.port = Some(open_port(&self.port_name, &self.settings)?);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.port_name, "cable tester connection closed");
        }
        self.read_buf.clear();
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}
