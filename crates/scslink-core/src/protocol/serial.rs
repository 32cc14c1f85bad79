//! Serial port handling
//!
//! Provides port discovery and a [`Transport`] backed by a real serial port.
//! A reader thread owns a clone of the port handle and pushes every received
//! byte into an [`RxQueue`], which wakes the session through its notifier.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::stream::{RxNotify, RxQueue, Transport};
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Read timeout of the reader thread; bounds how long `close` waits for it
const READER_POLL: Duration = Duration::from_millis(50);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key putting USB adapters (ttyUSB*, then ttyACM*) ahead of other
/// ports, numerically by suffix
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(num) = rest.parse::<usize>() {
            return (2, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: udev sometimes misses optical-probe adapters
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with the reader thread's poll timeout
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let port = serialport::new(name, baud).timeout(READER_POLL).open()?;
    Ok(port)
}

/// Configure a serial port for meter communication (8N1, no flow control)
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Optical probes draw power from DTR/RTS
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        debug!("configure_port: failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

/// [`Transport`] over a serial port
pub struct SerialTransport {
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    rx: RxQueue,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Create a closed transport that will open at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            port: None,
            rx: RxQueue::default(),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Baud rate used on open
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn spawn_reader(&mut self, mut port: Box<dyn SerialPort>) -> Result<(), ProtocolError> {
        let rx = self.rx.clone();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("scs-serial-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !stop.load(Ordering::Acquire) {
                    match port.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            trace!(bytes = ?&buf[..n], "rx");
                            rx.push(&buf[..n]);
                        }
                        Err(e)
                            if e.kind() == io::ErrorKind::TimedOut
                                || e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!("serial reader stopped: {}", e);
                            break;
                        }
                    }
                }
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, identifier: &str) -> Result<(), ProtocolError> {
        if self.port.is_some() {
            return Err(ProtocolError::AlreadyOpen);
        }

        let mut port = open_port(identifier, Some(self.baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        self.rx.clear();

        let reader_port = port.try_clone()?;
        self.stop.store(false, Ordering::Release);
        self.spawn_reader(reader_port)?;
        self.port = Some(port);

        debug!(port = identifier, baud = self.baud_rate, "serial transport open");
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("serial reader thread panicked");
            }
        }
        if self.port.take().is_some() {
            debug!("serial transport closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotOpen)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        if self.port.is_none() {
            return Err(ProtocolError::NotOpen);
        }
        Ok(self.rx.read_timeout(buf, timeout))
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        if let Some(port) = self.port.as_mut() {
            port.clear(serialport::ClearBuffer::Input)?;
        }
        self.rx.clear();
        Ok(())
    }

    fn rx_notify(&self) -> RxNotify {
        self.rx.notifier()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
