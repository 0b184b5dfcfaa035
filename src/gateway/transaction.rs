//! The unit of work crossing from a client session to the bus worker.
//!
//! A transaction carries the request bytes plus a one-shot completion
//! channel. The worker consumes the transaction to deliver its verdict, so
//! the "set exactly once" rule is enforced by ownership rather than by a
//! guard flag; if the session has already given up waiting, the verdict
//! lands in a dropped receiver and disappears.

use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// What went wrong on the serial bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    /// No response header arrived within the per-attempt timeout.
    Timeout,
    /// A response arrived but its checksum did not verify.
    Crc,
    /// Device-level serial failure (port gone, write error).
    Io,
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusFault::Timeout => write!(f, "response timeout"),
            BusFault::Crc => write!(f, "checksum mismatch"),
            BusFault::Io => write!(f, "serial I/O failure"),
        }
    }
}

/// Terminal verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The slave answered; response PDU with address and CRC stripped.
    Reply(Bytes),
    /// Broadcast request: written once, no reply expected on the bus.
    Broadcast,
    /// Every bus attempt failed.
    Failed(BusFault),
}

/// One in-flight request, owned by the worker for the duration of bus I/O.
pub struct Transaction {
    pub tx_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
    pub deadline: Instant,
    done: oneshot::Sender<Outcome>,
}

/// Session-side handle observing the worker's verdict.
pub struct WaitHandle {
    rx: oneshot::Receiver<Outcome>,
    deadline: Instant,
}

impl Transaction {
    /// Construct a pending transaction and the wait handle for its verdict.
    pub fn new(tx_id: u16, unit_id: u8, pdu: Bytes, deadline: Instant) -> (Self, WaitHandle) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                tx_id,
                unit_id,
                pdu,
                deadline,
                done,
            },
            WaitHandle { rx, deadline },
        )
    }

    /// Unit id 0 addresses every slave at once and gets no reply.
    pub fn is_broadcast(&self) -> bool {
        self.unit_id == 0
    }

    pub fn complete_ok(self, pdu: Bytes) {
        self.finish(Outcome::Reply(pdu));
    }

    pub fn complete_broadcast(self) {
        self.finish(Outcome::Broadcast);
    }

    pub fn complete_err(self, fault: BusFault) {
        self.finish(Outcome::Failed(fault));
    }

    fn finish(self, outcome: Outcome) {
        // send fails only when the session abandoned the wait; nothing to do
        let _ = self.done.send(outcome);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.tx_id)
            .field("unit_id", &self.unit_id)
            .field("pdu_len", &self.pdu.len())
            .finish_non_exhaustive()
    }
}

impl WaitHandle {
    /// Block until the verdict arrives or the transaction deadline passes.
    ///
    /// `None` means the gateway-side wait expired; the worker may still be
    /// retrying on the bus, and its eventual verdict is discarded.
    pub fn wait(self) -> Option<Outcome> {
        self.rx.recv_deadline(self.deadline).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    #[test]
    fn test_completion_reaches_waiter() {
        let (tx, wait) = Transaction::new(7, 0x11, Bytes::from_static(&[0x03, 0x02]), soon());
        tx.complete_ok(Bytes::from_static(&[0x03, 0x00]));
        assert_eq!(
            wait.wait(),
            Some(Outcome::Reply(Bytes::from_static(&[0x03, 0x00])))
        );
    }

    #[test]
    fn test_failure_reaches_waiter() {
        let (tx, wait) = Transaction::new(7, 0x11, Bytes::from_static(&[0x03]), soon());
        tx.complete_err(BusFault::Timeout);
        assert_eq!(wait.wait(), Some(Outcome::Failed(BusFault::Timeout)));
    }

    #[test]
    fn test_wait_times_out() {
        let (tx, wait) = Transaction::new(
            7,
            0x11,
            Bytes::from_static(&[0x03]),
            Instant::now() + Duration::from_millis(30),
        );
        assert_eq!(wait.wait(), None);
        // late verdict after the waiter gave up must be harmless
        tx.complete_err(BusFault::Timeout);
    }

    #[test]
    fn test_broadcast_detection() {
        let (tx, _wait) = Transaction::new(1, 0, Bytes::from_static(&[0x06]), soon());
        assert!(tx.is_broadcast());
        let (tx, _wait) = Transaction::new(1, 0x11, Bytes::from_static(&[0x06]), soon());
        assert!(!tx.is_broadcast());
    }
}
