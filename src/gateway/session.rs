//! Per-connection Modbus TCP session.
//!
//! Each accepted socket gets one session thread. Sessions share nothing but
//! the handoff queue: a session reads one MBAP request, hands it to the bus
//! worker, waits for the verdict, and answers on its own socket. At most one
//! request per connection is in flight at a time, so the transaction id
//! never needs to correlate anything beyond this socket.

use bytes::Bytes;
use flume::{SendTimeoutError, Sender};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::GatewayConfig;
use crate::gateway::transaction::{Outcome, Transaction};
use crate::protocol::frame::{
    decode_mbap_header, encode_mbap, exception_pdu, MbapHeader, EXC_GATEWAY_TARGET_FAILED,
    EXC_SERVER_BUSY, MBAP_HEADER_LEN,
};

/// Extra wait past the worker's response timeout before a session gives up.
const WAIT_SLACK: Duration = Duration::from_secs(2);
/// How long a submit may block on a saturated handoff queue before the
/// client is told the server is busy.
const SUBMIT_PATIENCE: Duration = Duration::from_millis(100);

/// Serve one client connection until it closes or misbehaves.
pub fn run_session(mut stream: TcpStream, submit: Sender<Transaction>, cfg: Arc<GatewayConfig>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    log::info!("Client {peer} connected");

    if let Err(err) = stream.set_read_timeout(Some(cfg.idle_timeout())) {
        log::warn!("Client {peer}: failed to set idle timeout: {err}");
        return;
    }
    if let Err(err) = stream.set_nodelay(true) {
        log::warn!("Client {peer}: failed to set TCP_NODELAY: {err}");
    }

    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                log::info!("Client {peer} disconnected");
                return;
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                log::info!(
                    "Client {peer} idle for {}s, closing",
                    cfg.tcp.idle_timeout_s
                );
                return;
            }
            Err(err) => {
                log::warn!("Client {peer} read error: {err}");
                return;
            }
        }

        let decoded = match decode_mbap_header(&header) {
            Ok(decoded) => decoded,
            Err(err) => {
                // a bad header leaves no transaction id that is safe to
                // echo, and a byte stream cannot be re-synchronized
                log::warn!("Client {peer} sent a malformed header ({err}), dropping connection");
                return;
            }
        };

        let mut pdu = vec![0u8; decoded.pdu_len];
        if let Err(err) = stream.read_exact(&mut pdu) {
            log::warn!("Client {peer} body read failed: {err}");
            return;
        }
        let request_fc = pdu[0];

        if log::log_enabled!(log::Level::Debug) {
            let hex = pdu
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            log::debug!(
                "Client {peer} tx {} -> unit 0x{:02X}: {hex}",
                decoded.tx_id,
                decoded.unit_id
            );
        }

        let deadline = Instant::now() + cfg.rtu.response_timeout() + WAIT_SLACK;
        let (transaction, verdict) =
            Transaction::new(decoded.tx_id, decoded.unit_id, Bytes::from(pdu), deadline);

        match submit.send_timeout(transaction, SUBMIT_PATIENCE) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("Handoff queue full, answering busy to {peer}");
                if respond(&mut stream, &peer, decoded, &exception_pdu(request_fc, EXC_SERVER_BUSY))
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                log::info!("Bus worker is gone, closing {peer}");
                return;
            }
        }

        let response: Vec<u8> = match verdict.wait() {
            Some(Outcome::Reply(reply)) => encode_mbap(decoded.tx_id, decoded.unit_id, &reply),
            Some(Outcome::Broadcast) => continue, // broadcasts get no reply
            Some(Outcome::Failed(fault)) => {
                log::debug!("Client {peer} tx {}: bus failure ({fault})", decoded.tx_id);
                encode_mbap(
                    decoded.tx_id,
                    decoded.unit_id,
                    &exception_pdu(request_fc, EXC_GATEWAY_TARGET_FAILED),
                )
            }
            None => {
                log::warn!(
                    "Client {peer} tx {}: bus verdict overdue, answering gateway timeout",
                    decoded.tx_id
                );
                encode_mbap(
                    decoded.tx_id,
                    decoded.unit_id,
                    &exception_pdu(request_fc, EXC_GATEWAY_TARGET_FAILED),
                )
            }
        };

        if stream.write_all(&response).is_err() {
            log::warn!("Client {peer} write failed, closing");
            return;
        }
    }
}

/// Write one MBAP-framed PDU back to the client.
fn respond(
    stream: &mut TcpStream,
    peer: &str,
    header: MbapHeader,
    pdu: &[u8],
) -> std::io::Result<()> {
    let adu = encode_mbap(header.tx_id, header.unit_id, pdu);
    match stream.write_all(&adu) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("Client {peer} write failed: {err}");
            Err(err)
        }
    }
}
