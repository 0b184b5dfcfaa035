//! The RTU worker: sole owner of the serial bus.
//!
//! Exactly one worker thread exists per gateway. It pulls transactions off
//! the handoff queue one at a time and runs each to a terminal verdict
//! before touching the next, which is what keeps the bus single-master no
//! matter how many TCP clients are connected.

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::RtuConfig;
use crate::gateway::link::{BusLink, BusOpener};
use crate::gateway::transaction::{BusFault, Transaction};
use crate::protocol::crc::verify_crc;
use crate::protocol::frame::{encode_rtu, strip_rtu, ResponseShape, MAX_RESPONSE_DATA_LEN};

/// Queue poll interval; bounds how late the worker notices a stop request.
const QUEUE_POLL: Duration = Duration::from_millis(200);
/// Pause between dropping a failed port handle and reopening it.
const REOPEN_PAUSE: Duration = Duration::from_millis(100);

pub struct RtuWorker {
    queue: Receiver<Transaction>,
    opener: Box<dyn BusOpener>,
    cfg: RtuConfig,
    shutdown: Arc<AtomicBool>,
    link: Option<Box<dyn BusLink>>,
}

impl RtuWorker {
    pub fn new(
        queue: Receiver<Transaction>,
        opener: Box<dyn BusOpener>,
        cfg: RtuConfig,
        shutdown: Arc<AtomicBool>,
        link: Box<dyn BusLink>,
    ) -> Self {
        Self {
            queue,
            opener,
            cfg,
            shutdown,
            link: Some(link),
        }
    }

    /// Move the worker onto its own thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(mut self) {
        log::info!("RTU worker started");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.queue.recv_timeout(QUEUE_POLL) {
                Ok(transaction) => self.execute(transaction),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // dropping the link closes the port
        log::info!("RTU worker stopped");
    }

    /// Run one transaction to its terminal verdict.
    fn execute(&mut self, transaction: Transaction) {
        let frame = encode_rtu(transaction.unit_id, &transaction.pdu);

        if transaction.is_broadcast() {
            // Broadcasts are unacknowledged: one write, then hold the gap
            // so slaves can act before the next frame goes out.
            match self.bus_write(&frame) {
                Ok(()) => {
                    thread::sleep(self.cfg.inter_frame_delay());
                    transaction.complete_broadcast();
                }
                Err(fault) => {
                    self.recover();
                    transaction.complete_err(fault);
                }
            }
            return;
        }

        let request_fc = transaction.pdu[0];
        let retries = self.cfg.retry_count.max(1);
        let mut last_fault = BusFault::Timeout;

        for attempt in 1..=retries {
            if attempt > 1 {
                thread::sleep(self.cfg.inter_frame_delay());
            }
            match self.attempt(transaction.unit_id, request_fc, &frame) {
                Ok(pdu) => {
                    transaction.complete_ok(pdu);
                    return;
                }
                Err(fault) => {
                    log::debug!(
                        "Attempt {attempt}/{retries} for unit 0x{:02X} failed: {fault}",
                        transaction.unit_id
                    );
                    last_fault = fault;
                    if fault == BusFault::Io {
                        self.recover();
                    }
                }
            }
        }

        log::warn!(
            "Request to unit 0x{:02X} failed after {retries} attempts: {last_fault}",
            transaction.unit_id
        );
        transaction.complete_err(last_fault);
    }

    /// One write/read exchange on the bus.
    fn attempt(&mut self, unit_id: u8, request_fc: u8, frame: &[u8]) -> Result<Bytes, BusFault> {
        self.bus_write(frame)?;

        // approximates the 3.5-character silent interval between frames
        thread::sleep(self.cfg.inter_frame_delay());

        let Some(link) = self.link.as_mut() else {
            return Err(BusFault::Io);
        };

        let mut response: Vec<u8> = Vec::with_capacity(8);
        read_into(link.as_mut(), &mut response, 2)?;

        match ResponseShape::classify(request_fc, response[1]) {
            ResponseShape::Exception => read_into(link.as_mut(), &mut response, 3)?,
            ResponseShape::FixedEcho => read_into(link.as_mut(), &mut response, 6)?,
            ResponseShape::ByteCountPrefixed => {
                read_into(link.as_mut(), &mut response, 1)?;
                let count = response[2] as usize;
                if count > MAX_RESPONSE_DATA_LEN {
                    log::warn!("Response byte count {count} exceeds the frame limit");
                    return Err(BusFault::Crc);
                }
                read_into(link.as_mut(), &mut response, count + 2)?;
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            let hex = response
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            log::debug!("bus RX: {hex}");
        }

        if !verify_crc(&response) {
            return Err(BusFault::Crc);
        }
        if response[0] != unit_id {
            // cannot legally happen on a single-master bus after the input
            // buffer was discarded, but worth a trace when wiring is bad
            log::warn!(
                "Response came from unit 0x{:02X}, expected 0x{unit_id:02X}",
                response[0]
            );
        }

        Ok(strip_rtu(&response))
    }

    /// Clear stale bytes and put one frame on the wire.
    fn bus_write(&mut self, frame: &[u8]) -> Result<(), BusFault> {
        if self.link.is_none() {
            match self.opener.open() {
                Ok(link) => {
                    log::info!("Serial port reopened");
                    self.link = Some(link);
                }
                Err(err) => {
                    log::warn!("Serial reopen failed: {err:#}");
                    return Err(BusFault::Io);
                }
            }
        }
        let Some(link) = self.link.as_mut() else {
            return Err(BusFault::Io);
        };

        link.discard_input().map_err(|_| BusFault::Io)?;
        link.send_frame(frame).map_err(|_| BusFault::Io)?;

        if log::log_enabled!(log::Level::Debug) {
            let hex = frame
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            log::debug!("bus TX: {hex}");
        }
        Ok(())
    }

    /// Drop the failed port handle, pause, and try to get a fresh one.
    ///
    /// When reopening fails the link stays closed and the next attempt (or
    /// the next transaction) retries; the worker itself never exits over a
    /// device error.
    fn recover(&mut self) {
        self.link = None;
        thread::sleep(REOPEN_PAUSE);
        match self.opener.open() {
            Ok(link) => {
                log::info!("Serial port reopened after I/O error");
                self.link = Some(link);
            }
            Err(err) => {
                log::warn!("Serial reopen failed: {err:#}");
            }
        }
    }
}

/// Extend `buf` by exactly `n` freshly read bytes.
fn read_into(link: &mut dyn BusLink, buf: &mut Vec<u8>, n: usize) -> Result<(), BusFault> {
    let start = buf.len();
    buf.resize(start + n, 0);
    match link.recv_exact(&mut buf[start..]) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::TimedOut => {
            buf.truncate(start);
            Err(BusFault::Timeout)
        }
        Err(_) => {
            buf.truncate(start);
            Err(BusFault::Io)
        }
    }
}
