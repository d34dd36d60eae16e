//! Contains the writer used to compose package payloads
use bytes::{BufMut, BytesMut};

/// Append Mysql/Mariadb encoded values to a payload buffer
pub struct PackageWriter<'a> {
    /// Buffer the payload is composed into
    buff: &'a mut BytesMut,
}

impl<'a> PackageWriter<'a> {
    /// Construct a writer appending to buff
    pub fn new(buff: &'a mut BytesMut) -> Self {
        Self { buff }
    }

    /// Number of bytes in the payload so far
    pub fn len(&self) -> usize {
        self.buff.len()
    }

    /// Return true if nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buff.is_empty()
    }

    /// Write a u8 to the package
    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buff.put_u8(v)
    }

    /// Write a u16 to the package
    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buff.put_u16_le(v)
    }

    /// Write the lower three bytes of v to the package
    #[inline]
    pub fn put_u24(&mut self, v: u32) {
        self.buff.put_uint_le(u64::from(v & 0xFF_FFFF), 3)
    }

    /// Write a u32 to the package
    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buff.put_u32_le(v)
    }

    /// Write a u64 to the package
    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buff.put_u64_le(v)
    }

    /// Write a f64 to the package
    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buff.put_f64_le(v)
    }

    /// Write a length encoded integer using the shortest encoding
    #[inline]
    pub fn put_lenenc(&mut self, v: u64) {
        if v < 0xFB {
            self.put_u8(v as u8);
        } else if v <= 0xFFFF {
            self.put_u8(0xFC);
            self.put_u16(v as u16);
        } else if v <= 0xFF_FFFF {
            self.put_u8(0xFD);
            self.put_u24(v as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64(v);
        }
    }

    /// Write a length encoded string or blob
    #[inline]
    pub fn put_lenenc_bytes(&mut self, v: &[u8]) {
        self.put_lenenc(v.len() as u64);
        self.put_bytes(v);
    }

    /// Write a null terminated string to the package
    #[inline]
    pub fn put_str_null(&mut self, s: &str) {
        self.buff.put(s.as_bytes());
        self.buff.put_u8(0);
    }

    /// Write some bytes to the package
    #[inline]
    pub fn put_bytes(&mut self, s: &[u8]) {
        self.buff.put(s);
    }

    /// Write `n` zero bytes to the package
    #[inline]
    pub fn put_zeros(&mut self, n: usize) {
        self.buff.put_bytes(0, n);
    }
}

#[cfg(test)]
mod tests {
    use super::PackageWriter;
    use bytes::BytesMut;

    #[test]
    fn lenenc_sizes() {
        let cases: [(u64, &[u8]); 5] = [
            (0xFA, &[0xFA]),
            (0xFB, &[0xFC, 0xFB, 0x00]),
            (0x1234, &[0xFC, 0x34, 0x12]),
            (0x12_3456, &[0xFD, 0x56, 0x34, 0x12]),
            (0x100_0000, &[0xFE, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (v, expected) in cases {
            let mut buff = BytesMut::new();
            PackageWriter::new(&mut buff).put_lenenc(v);
            assert_eq!(&buff[..], expected, "value {v:#x}");
        }
    }
}
