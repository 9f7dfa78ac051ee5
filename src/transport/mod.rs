//! Serial transport: owned port handles and exclusive exchanges.
//!
//! The probe protocol has no response framing byte; a reply is recognized
//! only by bytes ceasing to arrive for one polling slice. [`PortHandle::
//! exchange`] therefore writes the command and accumulates input in small
//! slices until the line goes quiet or the command's timeout elapses.
//!
//! Blocking serial I/O runs on the Tokio blocking pool with the per-port
//! mutex taken via `blocking_lock`, so a poll cycle and a calibration
//! exchange on the same port serialize while different ports proceed
//! concurrently.

pub mod mock;

use crate::error::TransportError;
use crate::protocol::Command;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Blocking byte-level I/O for one port. The seam between the registry and
/// real or mock serial hardware.
pub trait PortIo: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever arrives within one slice. `Ok(0)` means a quiet slice.
    fn read_slice(&mut self, buf: &mut [u8], slice: Duration) -> io::Result<usize>;

    /// Drop any unread input.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Shared handle to one open port.
#[derive(Clone)]
pub struct PortHandle {
    name: String,
    read_slice: Duration,
    io: Arc<Mutex<Box<dyn PortIo>>>,
}

impl PortHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one command and collect its reply under the per-port lock.
    ///
    /// Stale input is discarded first. Read errors during polling count as
    /// quiet slices; the protocol has no mid-frame recovery, so a partial
    /// frame is abandoned by letting the timeout run out and retrying at a
    /// higher level.
    pub async fn exchange(&self, command: &Command) -> Result<String, TransportError> {
        let io = self.io.clone();
        let name = self.name.clone();
        let wire = command.to_wire();
        let timeout = command.timeout;
        let slice = self.read_slice;

        tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
            let mut port = io.blocking_lock();

            if let Err(e) = port.discard_input() {
                debug!("[{name}] could not discard stale input: {e}");
            }

            port.write_all(wire.as_bytes())
                .map_err(|source| TransportError::WriteFailed {
                    port: name.clone(),
                    source,
                })?;
            debug!("[{name}] sent: {}", wire.trim_end());

            let start = Instant::now();
            let mut collected: Vec<u8> = Vec::new();
            let mut buf = [0u8; 256];

            loop {
                let got = match port.read_slice(&mut buf, slice) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("[{name}] read error treated as quiet slice: {e}");
                        0
                    }
                };

                if got > 0 {
                    collected.extend_from_slice(&buf[..got]);
                } else if !collected.is_empty() {
                    // Data arrived and then stopped for a full slice.
                    break;
                }

                if start.elapsed() >= timeout {
                    break;
                }
            }

            if collected.is_empty() {
                return Err(TransportError::NoResponse(name));
            }

            let text = String::from_utf8_lossy(&collected).trim().to_string();
            debug!("[{name}] received: {text}");
            Ok(text)
        })
        .await
        .map_err(|_| TransportError::TaskPanicked)?
    }
}

/// Owns every open serial connection, keyed by port name.
///
/// Exactly one connection per port name: a duplicate open finds the
/// existing handle and the newcomer is closed. Constructed empty and torn
/// down with [`TransportRegistry::close_all`]; passed by `Arc` to whichever
/// component needs to send commands.
pub struct TransportRegistry {
    read_slice: Duration,
    ports: Mutex<HashMap<String, PortHandle>>,
}

impl TransportRegistry {
    pub fn new(read_slice: Duration) -> Self {
        Self {
            read_slice,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Open `name` with the fixed line parameters, or return the existing
    /// handle if the port is already tracked.
    #[cfg(feature = "instrument_serial")]
    pub async fn open_or_reuse(
        &self,
        name: &str,
        baud_rate: u32,
    ) -> Result<PortHandle, TransportError> {
        if let Some(handle) = self.handle(name).await {
            return Ok(handle);
        }
        let io = serial::SerialPortIo::open(name, baud_rate)?;
        Ok(self.install(name, Box::new(io)).await)
    }

    #[cfg(not(feature = "instrument_serial"))]
    pub async fn open_or_reuse(
        &self,
        _name: &str,
        _baud_rate: u32,
    ) -> Result<PortHandle, TransportError> {
        Err(TransportError::FeatureDisabled)
    }

    /// Track an already-opened port. If the name is taken, the existing
    /// handle wins and the newcomer is dropped (closing it).
    pub async fn install(&self, name: &str, io: Box<dyn PortIo>) -> PortHandle {
        let mut ports = self.ports.lock().await;
        if let Some(existing) = ports.get(name) {
            debug!("port '{name}' already open; closing duplicate");
            drop(io);
            return existing.clone();
        }
        let handle = PortHandle {
            name: name.to_string(),
            read_slice: self.read_slice,
            io: Arc::new(Mutex::new(io)),
        };
        ports.insert(name.to_string(), handle.clone());
        handle
    }

    pub async fn handle(&self, name: &str) -> Option<PortHandle> {
        self.ports.lock().await.get(name).cloned()
    }

    pub async fn is_open(&self, name: &str) -> bool {
        self.ports.lock().await.contains_key(name)
    }

    pub async fn open_ports(&self) -> Vec<String> {
        self.ports.lock().await.keys().cloned().collect()
    }

    /// Close and forget one port.
    pub async fn close(&self, name: &str) {
        if self.ports.lock().await.remove(name).is_some() {
            debug!("closed port '{name}'");
        }
    }

    /// Best-effort close of every tracked handle. Shutdown path; never
    /// fails.
    pub async fn close_all(&self) {
        let mut ports = self.ports.lock().await;
        let count = ports.len();
        ports.clear();
        if count > 0 {
            info!("closed {count} serial port(s)");
        }
    }
}

/// Enumerate candidate serial ports on the host.
#[cfg(feature = "instrument_serial")]
pub fn available_port_names() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("serial port enumeration failed: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "instrument_serial"))]
pub fn available_port_names() -> Vec<String> {
    Vec::new()
}

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::{PortIo, TransportError};
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io;
    use std::time::Duration;

    /// Real serial port with the protocol's fixed line parameters:
    /// 8 data bits, no parity, 1 stop bit, no flow control.
    pub struct SerialPortIo {
        port: Box<dyn SerialPort>,
    }

    impl SerialPortIo {
        pub fn open(name: &str, baud_rate: u32) -> Result<Self, TransportError> {
            let port = serialport::new(name, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(20))
                .open()
                .map_err(|e| TransportError::OpenFailed {
                    port: name.to_string(),
                    source: e.into(),
                })?;
            Ok(Self { port })
        }
    }

    impl PortIo for SerialPortIo {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            io::Write::write_all(&mut self.port, bytes)?;
            io::Write::flush(&mut self.port)
        }

        fn read_slice(&mut self, buf: &mut [u8], slice: Duration) -> io::Result<usize> {
            self.port.set_timeout(slice).map_err(io::Error::from)?;
            match io::Read::read(&mut self.port, buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
        }
    }
}
