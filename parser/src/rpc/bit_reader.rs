use crate::error::ErrorKind;

/// MSB-first bit reader over a byte slice, used for the index paths of nested
/// property updates.
pub struct BitReader<'a> {
    data: &'a [u8],
    inner: bitreader::BitReader<'a>,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            inner: bitreader::BitReader::new(data),
        }
    }

    /// Number of bits needed to address `count` distinct values.
    pub fn bits_required(count: usize) -> u8 {
        if count < 1 {
            return 0;
        }
        // ceil(log2(count))
        (usize::BITS - (count - 1).leading_zeros()) as u8
    }

    pub fn read_bits(&mut self, bits: u8) -> Result<u64, ErrorKind> {
        if bits == 0 {
            return Ok(0);
        }
        if bits > 64 {
            return Err(ErrorKind::NestedProperty(format!(
                "cannot read {} bits at once",
                bits
            )));
        }
        if self.inner.remaining() < bits as u64 {
            return Err(ErrorKind::BitReaderExhausted {
                bits_read: self.inner.position(),
            });
        }
        Ok(self.inner.read_u64(bits)?)
    }

    pub fn read_bit(&mut self) -> Result<bool, ErrorKind> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn bits_read(&self) -> u64 {
        self.inner.position()
    }

    pub fn bytes_consumed(&self) -> usize {
        self.inner.position().div_ceil(8) as usize
    }

    /// Bytes following the byte currently being consumed.
    pub fn rest(&self) -> &'a [u8] {
        let consumed = self.bytes_consumed().min(self.data.len());
        &self.data[consumed..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bits_required_matches_log2() {
        assert_eq!(BitReader::bits_required(0), 0);
        assert_eq!(BitReader::bits_required(1), 0);
        assert_eq!(BitReader::bits_required(2), 1);
        assert_eq!(BitReader::bits_required(3), 2);
        assert_eq!(BitReader::bits_required(4), 2);
        assert_eq!(BitReader::bits_required(5), 3);
        assert_eq!(BitReader::bits_required(256), 8);
        assert_eq!(BitReader::bits_required(257), 9);
    }

    #[test]
    fn reads_msb_first_across_bytes() {
        let data = [0b1010_0000, 0b1111_0000, 0xAB];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(1).unwrap(), 1);
        assert_eq!(reader.read_bits(2).unwrap(), 0b01);
        assert_eq!(reader.read_bits(7).unwrap(), 0b0_0000_11);
        assert_eq!(reader.bytes_consumed(), 2);
        assert_eq!(reader.rest(), &[0xAB]);
    }

    #[test]
    fn rest_after_whole_byte() {
        let data = [0xFF, 0x01, 0x02];
        let mut reader = BitReader::new(&data);
        reader.read_bits(8).unwrap();
        assert_eq!(reader.rest(), &[0x01, 0x02]);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let data = [0xFF];
        let mut reader = BitReader::new(&data);
        reader.read_bits(6).unwrap();
        assert!(matches!(
            reader.read_bits(3),
            Err(ErrorKind::BitReaderExhausted { bits_read: 6 })
        ));
    }

    proptest! {
        #[test]
        fn sequential_reads_track_position(
            data in proptest::collection::vec(any::<u8>(), 16..32),
            widths in proptest::collection::vec(0u8..=64, 1..3),
        ) {
            let mut reader = BitReader::new(&data);
            let mut total = 0u64;
            for width in widths {
                let value = reader.read_bits(width).unwrap();
                if width < 64 {
                    prop_assert!(value < (1u64 << width));
                }
                total += width as u64;
                prop_assert_eq!(reader.bits_read(), total);
                prop_assert_eq!(reader.bytes_consumed() as u64, total.div_ceil(8));
            }
        }

        #[test]
        fn split_read_matches_single_read(data in proptest::collection::vec(any::<u8>(), 8), split in 0u8..=64) {
            let mut whole = BitReader::new(&data);
            let expected = whole.read_bits(64).unwrap();

            let mut parts = BitReader::new(&data);
            let high = parts.read_bits(split).unwrap();
            let low = parts.read_bits(64 - split).unwrap();
            let combined = if split == 0 {
                low
            } else if split == 64 {
                high
            } else {
                (high << (64 - split)) | low
            };
            prop_assert_eq!(combined, expected);
        }
    }
}
