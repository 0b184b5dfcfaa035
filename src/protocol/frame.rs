//! Modbus TCP (MBAP) and RTU framing.
//!
//! The PDU (function code + data) is identical on both transports; only the
//! envelope differs. TCP wraps it in a 7-byte MBAP header, RTU prefixes the
//! slave address and appends a CRC-16.

use bytes::Bytes;
use std::fmt;

use super::crc::append_crc;

/// MBAP header length on the wire.
pub const MBAP_HEADER_LEN: usize = 7;
/// Maximum PDU length (function code + data).
pub const MAX_PDU_LEN: usize = 253;
/// Maximum RTU frame length (address + PDU + CRC).
pub const MAX_RTU_FRAME_LEN: usize = 256;
/// Maximum data bytes in a byte-count-prefixed response.
pub const MAX_RESPONSE_DATA_LEN: usize = 252;

/// Exception code 0x0B: gateway target device failed to respond.
pub const EXC_GATEWAY_TARGET_FAILED: u8 = 0x0B;
/// Exception code 0x06: server device busy.
pub const EXC_SERVER_BUSY: u8 = 0x06;

/// Decoded MBAP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub tx_id: u16,
    pub unit_id: u8,
    pub pdu_len: usize,
}

/// Why an MBAP header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbapError {
    /// Protocol identifier was not zero.
    BadProtocol(u16),
    /// Length field implies a PDU shorter than 1 or longer than 253 bytes.
    BadLength(u16),
}

impl fmt::Display for MbapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MbapError::BadProtocol(proto) => write!(f, "protocol id 0x{proto:04X} (must be 0)"),
            MbapError::BadLength(length) => write!(f, "length field {length} out of range"),
        }
    }
}

/// Decode a 7-byte MBAP header.
///
/// The returned `pdu_len` is the number of body bytes still to be read from
/// the stream (the length field minus the unit id byte).
pub fn decode_mbap_header(header: &[u8; MBAP_HEADER_LEN]) -> Result<MbapHeader, MbapError> {
    let proto = u16::from_be_bytes([header[2], header[3]]);
    if proto != 0 {
        return Err(MbapError::BadProtocol(proto));
    }
    let length = u16::from_be_bytes([header[4], header[5]]);
    if length < 2 || (length as usize) - 1 > MAX_PDU_LEN {
        return Err(MbapError::BadLength(length));
    }
    Ok(MbapHeader {
        tx_id: u16::from_be_bytes([header[0], header[1]]),
        unit_id: header[6],
        pdu_len: (length as usize) - 1,
    })
}

/// Build a complete Modbus TCP ADU around `pdu`.
pub fn encode_mbap(tx_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    debug_assert!(!pdu.is_empty() && pdu.len() <= MAX_PDU_LEN);
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&tx_id.to_be_bytes());
    adu.extend_from_slice(&[0x00, 0x00]);
    adu.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Build a complete RTU frame (`addr + pdu + crc`) around `pdu`.
pub fn encode_rtu(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    append_crc(&mut frame);
    frame
}

/// Strip the address byte and trailing CRC from a verified RTU frame.
pub fn strip_rtu(frame: &[u8]) -> Bytes {
    debug_assert!(frame.len() >= 4);
    Bytes::copy_from_slice(&frame[1..frame.len() - 2])
}

/// PDU of a Modbus exception response.
pub fn exception_pdu(function: u8, code: u8) -> [u8; 2] {
    [function | 0x80, code]
}

/// Expected shape of an RTU response frame.
///
/// Decided from the request function code plus the function byte echoed by
/// the slave, so the reader knows how many bytes complete the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `addr + (fc|0x80) + code + crc`, 5 bytes total.
    Exception,
    /// Write acknowledgements echo 4 data bytes: `addr + fc + 4 + crc` = 8.
    FixedEcho,
    /// Reads carry a byte count right after the function code.
    ///
    /// Function codes outside the common set default here; shapes that do
    /// not actually follow it (0x2B and friends) fail the CRC or length
    /// check downstream and surface as a gateway exception.
    ByteCountPrefixed,
}

impl ResponseShape {
    pub fn classify(request_fc: u8, response_fc: u8) -> Self {
        if response_fc & 0x80 != 0 {
            return ResponseShape::Exception;
        }
        match request_fc {
            0x05 | 0x06 | 0x0F | 0x10 => ResponseShape::FixedEcho,
            _ => ResponseShape::ByteCountPrefixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::verify_crc;

    #[test]
    fn test_mbap_roundtrip() {
        for pdu_len in 1..=MAX_PDU_LEN {
            let pdu: Vec<u8> = (0..pdu_len).map(|i| i as u8).collect();
            let adu = encode_mbap(0x1234, 0x11, &pdu);
            assert_eq!(adu.len(), MBAP_HEADER_LEN + pdu_len);

            let mut header = [0u8; MBAP_HEADER_LEN];
            header.copy_from_slice(&adu[..MBAP_HEADER_LEN]);
            let decoded = decode_mbap_header(&header).unwrap();
            assert_eq!(decoded.tx_id, 0x1234);
            assert_eq!(decoded.unit_id, 0x11);
            assert_eq!(decoded.pdu_len, pdu_len);
            assert_eq!(&adu[MBAP_HEADER_LEN..], &pdu[..]);
        }
    }

    #[test]
    fn test_mbap_rejects_bad_protocol() {
        let mut adu = encode_mbap(5, 1, &[0x03, 0x00]);
        adu[2] = 0x00;
        adu[3] = 0x01;
        let mut header = [0u8; MBAP_HEADER_LEN];
        header.copy_from_slice(&adu[..MBAP_HEADER_LEN]);
        assert_eq!(
            decode_mbap_header(&header),
            Err(MbapError::BadProtocol(0x0001))
        );
    }

    #[test]
    fn test_mbap_rejects_bad_length() {
        // length 1 means a zero-byte PDU, length 255 means 254 bytes
        for bad in [0u16, 1, 255, 0xFFFF] {
            let mut header = [0u8; MBAP_HEADER_LEN];
            header[4..6].copy_from_slice(&bad.to_be_bytes());
            assert_eq!(decode_mbap_header(&header), Err(MbapError::BadLength(bad)));
        }
    }

    #[test]
    fn test_rtu_encode_strip() {
        let pdu = [0x03u8, 0x00, 0x6B, 0x00, 0x03];
        let frame = encode_rtu(0x11, &pdu);
        assert_eq!(frame.len(), pdu.len() + 3);
        assert!(verify_crc(&frame));
        assert_eq!(&strip_rtu(&frame)[..], &pdu[..]);
    }

    #[test]
    fn test_shape_classification() {
        // exception wins regardless of the request function
        assert_eq!(
            ResponseShape::classify(0x03, 0x83),
            ResponseShape::Exception
        );
        assert_eq!(
            ResponseShape::classify(0x10, 0x90),
            ResponseShape::Exception
        );
        for fc in [0x05u8, 0x06, 0x0F, 0x10] {
            assert_eq!(ResponseShape::classify(fc, fc), ResponseShape::FixedEcho);
        }
        for fc in [0x01u8, 0x02, 0x03, 0x04, 0x17, 0x2B, 0x41] {
            assert_eq!(
                ResponseShape::classify(fc, fc),
                ResponseShape::ByteCountPrefixed
            );
        }
    }

    #[test]
    fn test_exception_pdu() {
        assert_eq!(exception_pdu(0x03, EXC_GATEWAY_TARGET_FAILED), [0x83, 0x0B]);
        assert_eq!(exception_pdu(0x10, EXC_SERVER_BUSY), [0x90, 0x06]);
    }
}
