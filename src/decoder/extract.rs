//! Raw bit extraction from frame payloads.

/// Intel (little-endian) layout: `start_bit` is the LSB, bits counted
/// upward through the payload. `None` if the signal runs past the data.
pub(crate) fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    if (start_bit + length + 7) / 8 > data.len() {
        return None;
    }

    let mut result: u64 = 0;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
        result |= (bit as u64) << i;
    }
    Some(result)
}

/// Motorola (big-endian) layout in DBC numbering: `start_bit` is the MSB
/// and the signal continues at bit 7 of the next byte after bit 0.
pub(crate) fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut bit_pos = start_bit;

    for _ in 0..length {
        let byte = *data.get(bit_pos / 8)?;
        let bit = (byte >> (bit_pos % 8)) & 0x01;
        result = (result << 1) | bit as u64;

        bit_pos = if bit_pos % 8 == 0 {
            bit_pos + 15
        } else {
            bit_pos - 1
        };
    }
    Some(result)
}

/// Sign-extend an N-bit two's complement value.
pub(crate) fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if value & sign_bit != 0 {
        (value | (!0u64 << bit_length)) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_single_byte() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 8), Some(0xAB));
    }

    #[test]
    fn test_little_endian_cross_byte() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 16), Some(0xCDAB));
        assert_eq!(extract_little_endian(&data, 4, 8), Some(0xDA));
    }

    #[test]
    fn test_little_endian_out_of_range() {
        assert_eq!(extract_little_endian(&[0xFF], 4, 8), None);
    }

    #[test]
    fn test_big_endian() {
        let data = [0x12, 0x34, 0x56];
        assert_eq!(extract_big_endian(&data, 7, 8), Some(0x12));
        assert_eq!(extract_big_endian(&data, 7, 16), Some(0x1234));
        // Low nibble of byte 0 followed by high nibble of byte 1.
        assert_eq!(extract_big_endian(&data, 3, 8), Some(0x23));
        assert_eq!(extract_big_endian(&data, 7, 32), None);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x8000, 16), -32768);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }
}
