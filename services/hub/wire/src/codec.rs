//! Little-endian field encoding helpers shared by the record types.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Bounds-checked little-endian reader over an unescaped payload
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Create a reader starting at `offset`
    pub fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, pos: offset }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                need: end,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte
    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean byte (non zero is true)
    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    /// Read a little-endian u16
    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian i16
    pub fn i16(&mut self) -> Result<i16, WireError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian u32
    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a fixed size array
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read `n` raw bytes
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Consume everything left
    pub fn rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.buf.len());
        self.pos = self.buf.len();
        &self.buf[start..]
    }

    /// Remaining bytes as a lossy UTF-8 string
    pub fn rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.rest()).into_owned()
    }
}

/// Write a string into a fixed, zero padded field
pub fn put_fixed_str(buf: &mut BytesMut, value: &str, width: usize) -> Result<(), WireError> {
    let raw = value.as_bytes();
    if raw.len() > width {
        return Err(WireError::Encoding(format!(
            "text of {} bytes exceeds field width {}",
            raw.len(),
            width
        )));
    }
    buf.put_slice(raw);
    buf.put_bytes(0, width - raw.len());
    Ok(())
}

/// Decode a zero padded text field
pub fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Freeze a buffer, rejecting an empty encoding
pub fn finish(buf: BytesMut) -> Result<Bytes, WireError> {
    if buf.is_empty() {
        return Err(WireError::Encoding("empty buffer".to_string()));
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_little_endian() {
        let data = [0x01, 0x34, 0x12, 0xFE, 0xFF, 0x78, 0x56, 0x34, 0x12];
        let mut r = FieldReader::new(&data, 0);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.i16().unwrap(), -2);
        assert_eq!(r.u32().unwrap(), 0x12345678);
        assert!(r.rest().is_empty());
    }

    #[test]
    fn test_reader_truncated() {
        let data = [0x01, 0x02];
        let mut r = FieldReader::new(&data, 1);
        assert_eq!(
            r.u32().unwrap_err(),
            WireError::Truncated { need: 5, got: 2 }
        );
    }

    #[test]
    fn test_fixed_str() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "kitchen", 31).unwrap();
        assert_eq!(buf.len(), 31);
        assert_eq!(fixed_str(&buf), "kitchen");

        let too_long = "x".repeat(32);
        assert!(put_fixed_str(&mut BytesMut::new(), &too_long, 31).is_err());
    }
}
