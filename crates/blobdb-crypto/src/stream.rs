use std::io::{self, Read, Write};

use crate::digest::{DigestType, MessageDigest, StreamingDigest};

/// Writer adapter that digests every byte written through it.
///
/// Used to stage a payload and compute its identity in a single pass.
#[derive(Debug)]
pub struct DigestingWriter<W> {
    inner: W,
    digest: StreamingDigest,
    written: u64,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W, digest_type: DigestType) -> Self {
        Self {
            inner,
            digest: digest_type.streaming(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Borrow the inner writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Finish, returning the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, MessageDigest, u64) {
        (self.inner, self.digest.finalize(), self.written)
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that digests every byte read through it.
#[derive(Debug)]
pub struct DigestingReader<R> {
    inner: R,
    digest: StreamingDigest,
    read: u64,
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R, digest_type: DigestType) -> Self {
        Self {
            inner,
            digest: digest_type.streaming(),
            read: 0,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Drain the remaining input and return the digest and total byte count.
    pub fn digest_to_end(mut self) -> io::Result<(MessageDigest, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok((self.digest.finalize(), self.read))
    }

    /// Finish without draining.
    pub fn finish(self) -> (R, MessageDigest, u64) {
        (self.inner, self.digest.finalize(), self.read)
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}
