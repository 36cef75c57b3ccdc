//! Variable-Byte Encoding (VBE).
//!
//! Integers are written in groups of 7 bits, least significant group first,
//! with the high bit of every byte except the last set as a continuation
//! flag. Negative values are sign-extended through every group and so always
//! take the maximum width (5 bytes for `i16`/`i32`, 10 bytes for `i64`);
//! callers that need compact negatives should zig-zag encode first.
//!
//! Fixed-width forms write exactly 2, 4 or 8 big-endian bytes and are meant
//! for values whose width must be known in advance, such as a reference count
//! that is later rewritten in place.
//!
//! The codec is exposed as extension traits over [`std::io::Read`] and
//! [`std::io::Write`], so it works unchanged on files, `Vec<u8>` and `&[u8]`.

mod read;
mod write;

pub use read::VariableByteRead;
pub use write::VariableByteWrite;

/// Maximum encoded width of an `i16` or `i32`.
pub const MAX_INT_LEN: usize = 5;
/// Maximum encoded width of an `i64`.
pub const MAX_LONG_LEN: usize = 10;

/// Encoded width of an unsigned value.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value & !0x7f != 0 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Encoded width of `i` as written by [`VariableByteWrite::write_int`].
pub fn int_len(i: i32) -> usize {
    varint_len(i as u32 as u64)
}

/// Encoded width of `l` as written by [`VariableByteWrite::write_long`].
pub fn long_len(l: i64) -> usize {
    varint_len(l as u64)
}

/// Encoded width of `s` as written by [`VariableByteWrite::write_utf`].
pub fn utf_len(s: &str) -> usize {
    let len = s.len();
    varint_len(len as u64) + len
}
