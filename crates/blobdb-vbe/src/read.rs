use std::io::{self, Read, Write};

use crate::{MAX_INT_LEN, MAX_LONG_LEN};

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// VBE decoding for any [`Read`].
pub trait VariableByteRead: Read {
    /// Read a single raw byte.
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Read an unsigned 7-bit-group value of at most `max_len` bytes.
    fn read_varint(&mut self, max_len: usize) -> io::Result<u64> {
        let mut value: u64 = 0;
        for i in 0..max_len {
            let b = self.read_byte()?;
            let group = (b & 0x7f) as u64;
            let shift = 7 * i as u32;
            if shift == 63 && group > 1 {
                return Err(invalid("varint overflows 64 bits"));
            }
            value |= group << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(invalid("varint too long"))
    }

    fn read_short(&mut self) -> io::Result<i16> {
        Ok(self.read_int()? as i16)
    }

    fn read_int(&mut self) -> io::Result<i32> {
        let v = self.read_varint(MAX_INT_LEN)?;
        if v > u32::MAX as u64 {
            return Err(invalid("varint overflows 32 bits"));
        }
        Ok(v as u32 as i32)
    }

    fn read_long(&mut self) -> io::Result<i64> {
        Ok(self.read_varint(MAX_LONG_LEN)? as i64)
    }

    fn read_fixed_short(&mut self) -> io::Result<i16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    fn read_fixed_int(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    fn read_fixed_long(&mut self) -> io::Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn read_utf(&mut self) -> io::Result<String> {
        let len = self.read_varint(MAX_INT_LEN)?;
        let mut data = Vec::new();
        (&mut *self).take(len).read_to_end(&mut data)?;
        if data.len() as u64 != len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        String::from_utf8(data).map_err(|_| invalid("string is not valid UTF-8"))
    }

    /// Skip `count` variable-width values.
    fn skip(&mut self, count: usize) -> io::Result<()> {
        for _ in 0..count {
            self.read_varint(MAX_LONG_LEN)?;
        }
        Ok(())
    }

    /// Skip `count` raw bytes.
    fn skip_bytes(&mut self, count: u64) -> io::Result<()> {
        let skipped = io::copy(&mut (&mut *self).take(count), &mut io::sink())?;
        if skipped != count {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Copy `count` encoded variable-width values verbatim to `out`.
    fn copy_to<W: Write + ?Sized>(&mut self, out: &mut W, count: usize) -> io::Result<()> {
        for _ in 0..count {
            for _ in 0..MAX_LONG_LEN {
                let b = self.read_byte()?;
                out.write_all(&[b])?;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Copy `count` raw bytes to `out`.
    fn copy_raw<W: Write + ?Sized>(&mut self, out: &mut W, count: u64) -> io::Result<()> {
        let copied = io::copy(&mut (&mut *self).take(count), out)?;
        if copied != count {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> VariableByteRead for R {}
