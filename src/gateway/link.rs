//! Byte-stream seam between the bus worker and the physical serial device.
//!
//! The worker only ever talks to a [`BusLink`]; production wraps a serial
//! port handle, tests substitute a scripted in-memory link.

use anyhow::{Context, Result};
use std::io;

use serialport::{ClearBuffer, SerialPort};

use crate::config::RtuConfig;

/// Blocking byte stream over the RS-485 bus.
///
/// Reads honor the device timeout configured at open time; a quiet bus
/// surfaces as `ErrorKind::TimedOut`.
pub trait BusLink: Send {
    /// Drop any unread bytes sitting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()>;
    /// Write one complete frame.
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Fill `buf` exactly, or fail with `TimedOut` when the bus stays quiet.
    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// Factory for the initial open and for reopening after device errors.
pub trait BusOpener: Send {
    fn open(&self) -> Result<Box<dyn BusLink>>;
}

/// Production link backed by an open serial port handle.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl BusLink for SerialLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(Into::into)
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                // drivers report an expired timeout either way
                Ok(0) => return Err(io::ErrorKind::TimedOut.into()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Opens [`SerialLink`]s from the configured line parameters.
pub struct SerialOpener {
    cfg: RtuConfig,
}

impl SerialOpener {
    pub fn new(cfg: RtuConfig) -> Self {
        Self { cfg }
    }
}

impl BusOpener for SerialOpener {
    fn open(&self) -> Result<Box<dyn BusLink>> {
        let builder = serialport::new(self.cfg.port.as_str(), self.cfg.baud)
            .timeout(self.cfg.response_timeout());
        let builder = self.cfg.apply_builder(builder);
        let port = builder
            .open()
            .with_context(|| format!("Opening serial port {}", self.cfg.port))?;
        Ok(Box::new(SerialLink { port }))
    }
}
