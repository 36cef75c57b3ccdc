use std::io::{self, Write};

/// VBE encoding for any [`Write`].
pub trait VariableByteWrite: Write {
    /// Write a single raw byte.
    fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.write_all(&[b])
    }

    /// Write an unsigned value in 7-bit groups.
    fn write_varint(&mut self, mut value: u64) -> io::Result<()> {
        let mut buf = [0u8; crate::MAX_LONG_LEN];
        let mut len = 0;
        while value & !0x7f != 0 {
            buf[len] = (value & 0x7f) as u8 | 0x80;
            value >>= 7;
            len += 1;
        }
        buf[len] = value as u8;
        self.write_all(&buf[..=len])
    }

    /// Variable-width `i16`; negatives are sign-extended to 32 bits.
    fn write_short(&mut self, s: i16) -> io::Result<()> {
        self.write_varint(s as i32 as u32 as u64)
    }

    /// Variable-width `i32`.
    fn write_int(&mut self, i: i32) -> io::Result<()> {
        self.write_varint(i as u32 as u64)
    }

    /// Variable-width `i64`.
    fn write_long(&mut self, l: i64) -> io::Result<()> {
        self.write_varint(l as u64)
    }

    fn write_fixed_short(&mut self, s: i16) -> io::Result<()> {
        self.write_all(&s.to_be_bytes())
    }

    fn write_fixed_int(&mut self, i: i32) -> io::Result<()> {
        self.write_all(&i.to_be_bytes())
    }

    fn write_fixed_long(&mut self, l: i64) -> io::Result<()> {
        self.write_all(&l.to_be_bytes())
    }

    /// Length-prefixed UTF-8 string.
    fn write_utf(&mut self, s: &str) -> io::Result<()> {
        self.write_varint(s.len() as u64)?;
        self.write_all(s.as_bytes())
    }
}

impl<W: Write + ?Sized> VariableByteWrite for W {}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> Vec<u8> {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        buf
    }

    #[test]
    fn small_values_are_one_byte() {
        assert_eq!(encode(|b| b.write_int(0)), vec![0x00]);
        assert_eq!(encode(|b| b.write_int(127)), vec![0x7f]);
    }

    #[test]
    fn continuation_bit_on_all_but_last() {
        assert_eq!(encode(|b| b.write_int(128)), vec![0x80, 0x01]);
        assert_eq!(encode(|b| b.write_int(300)), vec![0xac, 0x02]);
    }

    #[test]
    fn negative_int_is_sign_extended() {
        assert_eq!(
            encode(|b| b.write_int(-1)),
            vec![0xff, 0xff, 0xff, 0xff, 0x0f]
        );
        assert_eq!(encode(|b| b.write_short(-1)).len(), 5);
        assert_eq!(encode(|b| b.write_long(-1)).len(), 10);
    }

    #[test]
    fn fixed_widths_are_exact() {
        assert_eq!(encode(|b| b.write_fixed_short(0)).len(), 2);
        assert_eq!(encode(|b| b.write_fixed_int(0)).len(), 4);
        assert_eq!(encode(|b| b.write_fixed_long(0)).len(), 8);
        assert_eq!(encode(|b| b.write_fixed_int(1)), vec![0, 0, 0, 1]);
    }

    #[test]
    fn utf_is_length_prefixed() {
        assert_eq!(encode(|b| b.write_utf("ab")), vec![2, b'a', b'b']);
    }
}
