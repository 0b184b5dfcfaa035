//! CRC-16/Modbus: polynomial 0xA001 (reflected), initial value 0xFFFF,
//! appended to frames low byte first.

/// Compute the CRC over `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame` to it, low byte then high byte.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing two CRC bytes of a complete frame.
///
/// Frames shorter than the 4-byte RTU minimum never verify.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let split = frame.len() - 2;
    let calc = crc16_modbus(&frame[..split]);
    let frame_crc = u16::from_le_bytes([frame[split], frame[split + 1]]);
    calc == frame_crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // Read Holding Registers request with a well-known checksum
        let frame = [0x11u8, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(crc16_modbus(&frame), 0x8776);

        let mut full = frame.to_vec();
        append_crc(&mut full);
        assert_eq!(&full[6..], &[0x76, 0x87]);
        assert!(verify_crc(&full));
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 1..=254usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + len) as u8).collect();
            let mut frame = data.clone();
            append_crc(&mut frame);
            assert!(verify_crc(&frame), "length {len} failed to verify");
        }
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut frame = vec![0x11u8, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        append_crc(&mut frame);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !verify_crc(&corrupted),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(!verify_crc(&[]));
        assert!(!verify_crc(&[0x11, 0x03, 0x76]));
    }
}
