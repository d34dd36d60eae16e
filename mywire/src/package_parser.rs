//! Contains parser used to parse packages
use bytes::Buf;
use thiserror::Error;

/// Error returned by the [PackageParser]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The package was shorter than expected
    #[error("End of package")]
    EndOfPackage,
    /// You are decoding more columns than there is in the row
    #[error("End of columns")]
    EndOfColumns,
    /// A string in a package was not utf-8 as expected
    #[error("Utf-8 error at {valid_up_to}")]
    Utf8Error {
        /// The string is valid utf-8 until this many bytes
        valid_up_to: u32,
        /// The length of the error
        error_len: Option<u8>,
    },
    /// A length encoded integer started with a byte that is not a valid prefix
    #[error("Invalid length encoded integer prefix {0:#x}")]
    InvalidLengthPrefix(u8),
    /// A fixed length read asked for more bytes than fit the target type
    #[error("Invalid size {0}")]
    InvalidSize(u8),
    /// A binary row contained a column type we do not know the layout of
    #[error("Unknown column type {0:#x}")]
    UnknownType(u8),
}

const _: () = {
    assert!(size_of::<DecodeError>() <= 8);
};

impl From<bytes::TryGetError> for DecodeError {
    fn from(_value: bytes::TryGetError) -> Self {
        DecodeError::EndOfPackage
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        DecodeError::Utf8Error {
            valid_up_to: value.valid_up_to().try_into().unwrap_or(u32::MAX),
            error_len: value.error_len().map(|v| v.try_into().unwrap_or(0xFF)),
        }
    }
}

/// Result returned by [PackageParser]
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Bounds checked cursor over a Mysql/Mariadb package
///
/// All reads are little-endian and fail with [DecodeError::EndOfPackage]
/// instead of reading past the end of the window.
#[derive(Clone, Copy)]
pub struct PackageParser<'a> {
    /// The bytes not yet consumed
    rest: &'a [u8],
    /// Length of the window the parser was constructed over
    window: usize,
}

impl<'a> PackageParser<'a> {
    /// Construct a new [PackageParser] for the given package
    pub fn new(package: &'a [u8]) -> Self {
        Self {
            rest: package,
            window: package.len(),
        }
    }

    /// Construct a parser over `len` bytes of `buffer` starting at `offset`
    pub fn with_window(buffer: &'a [u8], offset: usize, len: usize) -> DecodeResult<Self> {
        let end = offset.checked_add(len).ok_or(DecodeError::EndOfPackage)?;
        let rest = buffer.get(offset..end).ok_or(DecodeError::EndOfPackage)?;
        Ok(Self::new(rest))
    }

    /// Number of bytes consumed so far
    #[inline]
    pub fn position(&self) -> usize {
        self.window - self.rest.len()
    }

    /// Number of bytes left in the window
    #[inline]
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Return the next byte without consuming it
    #[inline]
    pub fn peek_u8(&self) -> DecodeResult<u8> {
        self.rest.first().copied().ok_or(DecodeError::EndOfPackage)
    }

    /// Read a u8 from the package
    #[inline]
    pub fn get_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.rest.try_get_u8()?)
    }

    /// Read a i8 from the package
    #[inline]
    pub fn get_i8(&mut self) -> DecodeResult<i8> {
        Ok(self.rest.try_get_i8()?)
    }

    /// Read a u16 from the package
    #[inline]
    pub fn get_u16(&mut self) -> DecodeResult<u16> {
        Ok(self.rest.try_get_u16_le()?)
    }

    /// Read a i16 from the package
    #[inline]
    pub fn get_i16(&mut self) -> DecodeResult<i16> {
        Ok(self.rest.try_get_i16_le()?)
    }

    /// Read a u24 from the package
    #[inline]
    pub fn get_u24(&mut self) -> DecodeResult<u32> {
        self.get_fixed_u32(3)
    }

    /// Read a u32 from the package
    #[inline]
    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(self.rest.try_get_u32_le()?)
    }

    /// Read a i32 from the package
    #[inline]
    pub fn get_i32(&mut self) -> DecodeResult<i32> {
        Ok(self.rest.try_get_i32_le()?)
    }

    /// Read a u64 from the package
    #[inline]
    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        Ok(self.rest.try_get_u64_le()?)
    }

    /// Read a i64 from the package
    #[inline]
    pub fn get_i64(&mut self) -> DecodeResult<i64> {
        Ok(self.rest.try_get_i64_le()?)
    }

    /// Read a f32 from the package
    #[inline]
    pub fn get_f32(&mut self) -> DecodeResult<f32> {
        Ok(self.rest.try_get_f32_le()?)
    }

    /// Read a f64 from the package
    #[inline]
    pub fn get_f64(&mut self) -> DecodeResult<f64> {
        Ok(self.rest.try_get_f64_le()?)
    }

    /// Read a `n` byte little-endian unsigned integer, `n` must be at most 4
    #[inline]
    pub fn get_fixed_u32(&mut self, n: usize) -> DecodeResult<u32> {
        if n > 4 {
            return Err(DecodeError::InvalidSize(n.min(255) as u8));
        }
        Ok(self.get_fixed_u64(n)? as u32)
    }

    /// Read a `n` byte little-endian unsigned integer, `n` must be at most 8
    #[inline]
    pub fn get_fixed_u64(&mut self, n: usize) -> DecodeResult<u64> {
        if n > 8 {
            return Err(DecodeError::InvalidSize(n.min(255) as u8));
        }
        let bytes = self.get_bytes(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Read a variable encoded length
    ///
    /// See <https://mariadb.com/docs/server/reference/clientserver-protocol/protocol-data-types#length-encoded-integers>
    #[inline]
    pub fn get_lenenc(&mut self) -> DecodeResult<u64> {
        let v = self.get_u8()?;
        Ok(match v {
            0xFC => self.get_u16()?.into(),
            0xFD => self.get_u24()?.into(),
            0xFE => self.get_u64()?,
            0xFB | 0xFF => return Err(DecodeError::InvalidLengthPrefix(v)),
            v => v.into(),
        })
    }

    /// Read a variable encoded blob
    #[inline]
    pub fn get_lenenc_blob(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.get_lenenc()?;
        self.get_bytes(usize::try_from(len).map_err(|_| DecodeError::EndOfPackage)?)
    }

    /// Read a variable encoded utf8-string
    #[inline]
    pub fn get_lenenc_str(&mut self) -> DecodeResult<&'a str> {
        Ok(str::from_utf8(self.get_lenenc_blob()?)?)
    }

    /// Skip past a variable encoded string or blob
    #[inline]
    pub fn skip_lenenc_str(&mut self) -> DecodeResult<()> {
        self.get_lenenc_blob()?;
        Ok(())
    }

    /// Read bytes up to a null terminator, consuming the terminator
    #[inline]
    pub fn get_null_bytes(&mut self) -> DecodeResult<&'a [u8]> {
        let end = self
            .rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::EndOfPackage)?;
        let v = &self.rest[..end];
        self.rest.advance(end + 1);
        Ok(v)
    }

    /// Read a null-terminated string
    #[inline]
    pub fn get_null_str(&mut self) -> DecodeResult<&'a str> {
        let mut p = *self;
        let v = str::from_utf8(p.get_null_bytes()?)?;
        *self = p;
        Ok(v)
    }

    /// Skip past a null-terminated string
    #[inline]
    pub fn skip_null_str(&mut self) -> DecodeResult<()> {
        self.get_null_bytes()?;
        Ok(())
    }

    /// Read the rest of the package
    #[inline]
    pub fn get_eof_bytes(&mut self) -> &'a [u8] {
        let v = self.rest;
        self.rest = &[];
        v
    }

    /// Read the rest of the package as a utf-8 string
    #[inline]
    pub fn get_eof_str(&mut self) -> DecodeResult<&'a str> {
        let v = str::from_utf8(self.rest)?;
        self.rest.advance(v.len());
        Ok(v)
    }

    /// Read some bytes from the package
    #[inline]
    pub fn get_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        match self.rest.get(..len) {
            Some(v) => {
                self.rest.advance(len);
                Ok(v)
            }
            None => Err(DecodeError::EndOfPackage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DecodeError, PackageParser};
    use crate::package_writer::PackageWriter;
    use bytes::BytesMut;

    #[test]
    fn lenenc_round_trip() {
        let values = [
            0u64,
            1,
            0xFA,
            0xFB,
            0xFC,
            0xFFFF,
            0x1_0000,
            0xFF_FFFF,
            0x100_0000,
            u32::MAX as u64,
            u64::MAX - 1,
            u64::MAX,
        ];
        for v in values {
            let mut buff = BytesMut::new();
            PackageWriter::new(&mut buff).put_lenenc(v);
            let mut p = PackageParser::new(&buff);
            assert_eq!(p.get_lenenc().unwrap(), v, "value {v:#x}");
            assert_eq!(p.remaining(), 0);
        }
    }

    #[test]
    fn lenenc_invalid_prefix() {
        let mut p = PackageParser::new(&[0xFF, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(p.get_lenenc(), Err(DecodeError::InvalidLengthPrefix(0xFF)));
        let mut p = PackageParser::new(&[0xFF]);
        assert_eq!(p.get_lenenc(), Err(DecodeError::InvalidLengthPrefix(0xFF)));
    }

    #[test]
    fn lenenc_truncated() {
        let mut p = PackageParser::new(&[0xFE, 1, 2, 3]);
        assert_eq!(p.get_lenenc(), Err(DecodeError::EndOfPackage));
        let mut p = PackageParser::new(&[0xFC, 1]);
        assert_eq!(p.get_lenenc(), Err(DecodeError::EndOfPackage));
    }

    #[test]
    fn window_bounds() {
        let buffer = [1u8, 2, 3, 4, 5, 6];
        let mut p = PackageParser::with_window(&buffer, 2, 3).unwrap();
        assert_eq!(p.get_u8().unwrap(), 3);
        assert_eq!(p.position(), 1);
        assert_eq!(p.get_u16().unwrap(), 0x0504);
        // The byte after the window must not be visible
        assert_eq!(p.get_u8(), Err(DecodeError::EndOfPackage));
        assert!(PackageParser::with_window(&buffer, 4, 3).is_err());
    }

    #[test]
    fn fixed_length() {
        let mut p = PackageParser::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(p.get_fixed_u32(3).unwrap(), 0x030201);
        assert_eq!(p.get_fixed_u64(0).unwrap(), 0);
        assert_eq!(p.get_fixed_u64(3).unwrap(), 0x060504);
        assert_eq!(p.get_fixed_u32(5), Err(DecodeError::InvalidSize(5)));
        assert_eq!(p.get_fixed_u32(300), Err(DecodeError::InvalidSize(255)));
        assert_eq!(p.get_fixed_u64(9), Err(DecodeError::InvalidSize(9)));
    }

    #[test]
    fn null_terminated() {
        let mut p = PackageParser::new(b"abc\0de");
        assert_eq!(p.get_null_str().unwrap(), "abc");
        assert_eq!(p.get_null_bytes(), Err(DecodeError::EndOfPackage));
        // A failed read does not consume anything
        assert_eq!(p.get_eof_bytes(), b"de");
    }
}
