//! Utility functions and helpers for Modbus operations
//!
//! Bit packing for coil payloads and CRC-16 for RTU framing.

/// Coil/discrete input bit packing (LSB of the first byte is the first element)
pub mod bits {
    /// Pack booleans into bytes, 8 per byte
    pub fn pack(values: &[bool]) -> Vec<u8> {
        values
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (bit, &on)| if on { byte | (1 << bit) } else { byte })
            })
            .collect()
    }

    /// Unpack the first `count` bits of `bytes`
    pub fn unpack(bytes: &[u8], count: usize) -> Vec<bool> {
        (0..count)
            .map(|i| bytes.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0))
            .collect()
    }
}

/// CRC-16/MODBUS used by RTU frames
pub mod crc16 {
    use crc::{Crc, CRC_16_MODBUS};

    const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

    /// Calculate the CRC of `data`
    pub fn checksum(data: &[u8]) -> u16 {
        CRC_MODBUS.checksum(data)
    }

    /// Append the CRC to a frame (little-endian, as RTU requires)
    pub fn append(frame: &mut Vec<u8>) {
        let crc = checksum(frame);
        frame.extend_from_slice(&crc.to_le_bytes());
    }

    /// Split a frame into body and trailing CRC, returning `(expected, actual)` on mismatch
    pub fn verify(frame: &[u8]) -> Result<&[u8], (u16, u16)> {
        if frame.len() < 2 {
            return Err((0, 0));
        }
        let (body, tail) = frame.split_at(frame.len() - 2);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        let calculated = checksum(body);
        if received == calculated {
            Ok(body)
        } else {
            Err((calculated, received))
        }
    }
}

/// Initialize simple logger for testing
pub fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
