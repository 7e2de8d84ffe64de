use core::fmt;
use std::ops::Deref;

use crate::error::{Error, ErrorKind};

/// A device or module name held entirely on the stack.
///
/// On the wire a name occupies exactly `N` bytes, NUL-padded; in memory the
/// buffer is always zero-filled past `len`, so the stored form *is* the wire
/// form. A name that fills the buffer completely travels without a
/// terminator; its identifier still hashes the conceptual NUL (see
/// [`identifier`]).
///
/// # Examples
///
/// ```
/// use fmr_core::containers::name::NameBuf;
///
/// let name = NameBuf::<16>::try_from("led").unwrap();
/// assert_eq!(&*name, "led");
/// ```
///
/// [`identifier`]: NameBuf::identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameBuf<const N: usize> {
    len: usize,
    buf: [u8; N],
}

impl<const N: usize> NameBuf<N> {
    /// Creates an empty name with a zeroed buffer of size `N`.
    pub const fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; N],
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The NUL-padded wire form of the name.
    pub const fn as_wire(&self) -> &[u8; N] {
        &self.buf
    }

    /// The CRC of the name including its NUL terminator.
    pub fn identifier(&self) -> u16 {
        crate::crc::identifier(self)
    }

    /// Form a [`NameBuf`] from a buffer and a length.
    ///
    /// # SAFETY
    ///
    /// `buf[..len]` MUST be valid UTF-8 and `buf[len..]` MUST be zeroed.
    const unsafe fn from_raw_parts(buf: [u8; N], len: usize) -> Self {
        Self { len, buf }
    }
}

impl<const N: usize> Default for NameBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for NameBuf<N> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        // SAFETY: every constructor validates the prefix as UTF-8.
        unsafe { std::str::from_utf8_unchecked(&self.buf[..self.len]) }
    }
}

impl<const N: usize> TryFrom<&str> for NameBuf<N> {
    type Error = NameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() > N {
            return Err(NameError {
                max: N,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; N];
        buf[..value.len()].copy_from_slice(value.as_bytes());
        Ok(Self {
            len: value.len(),
            buf,
        })
    }
}

impl<const N: usize> fmt::Display for NameBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<const N: usize> bincode::Encode for NameBuf<N> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.buf, encoder)
    }
}

impl<Context, const N: usize> bincode::Decode<Context> for NameBuf<N> {
    fn decode<D: bincode::de::Decoder>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let (buf, len) = decode_and_validate(decoder)?;

        // SAFETY: the prefix was checked to be valid UTF-8 and the padding
        //         was checked to be zeroed.
        Ok(unsafe { Self::from_raw_parts(buf, len) })
    }
}

impl<'de, Context, const N: usize> bincode::BorrowDecode<'de, Context> for NameBuf<N> {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let (buf, len) = decode_and_validate(decoder)?;

        // SAFETY: as above.
        Ok(unsafe { Self::from_raw_parts(buf, len) })
    }
}

fn decode_and_validate<D: bincode::de::Decoder, const N: usize>(
    decoder: &mut D,
) -> Result<([u8; N], usize), bincode::error::DecodeError> {
    let mut buf: [u8; N] = bincode::Decode::decode(decoder)?;

    let len = buf.iter().position(|&b| b == 0).unwrap_or(N);
    std::str::from_utf8(&buf[..len])
        .map_err(|err| bincode::error::DecodeError::Utf8 { inner: err })?;
    // Normalize whatever the device left past the terminator.
    buf[len..].fill(0);

    Ok((buf, len))
}

/// The name did not fit the wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameError {
    max: usize,
    actual: usize,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name is too long ({} bytes, at most {} allowed)",
            self.actual, self.max
        )
    }
}

impl std::error::Error for NameError {}

impl From<NameError> for Error {
    fn from(value: NameError) -> Self {
        Error::new(ErrorKind::Name, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_config() -> impl bincode::config::Config {
        bincode::config::standard()
            .with_fixed_int_encoding()
            .with_little_endian()
    }

    #[test]
    fn stores_wire_form() {
        let name = NameBuf::<16>::try_from("button").unwrap();
        assert_eq!(name.len(), 6);
        assert_eq!(&name.as_wire()[..7], b"button\0");
        assert!(name.as_wire()[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn over_long_name_fails() {
        let result = NameBuf::<16>::try_from("seventeen bytes!!");
        assert_eq!(
            result,
            Err(NameError {
                max: 16,
                actual: 17
            })
        );
    }

    #[test]
    fn exactly_full_name_fits() {
        let name = NameBuf::<16>::try_from("sixteen.bytes.xy").unwrap();
        assert_eq!(name.len(), 16);
        assert_eq!(name.as_wire(), b"sixteen.bytes.xy");
    }

    #[test]
    fn decode_trims_padding() {
        let mut wire = [0u8; 16];
        wire[..4].copy_from_slice(b"gpio");
        let (name, read): (NameBuf<16>, usize) =
            bincode::decode_from_slice(&wire, wire_config()).unwrap();
        assert_eq!(read, 16);
        assert_eq!(&*name, "gpio");
    }

    #[test]
    fn decode_ignores_garbage_after_terminator() {
        let mut wire = [0u8; 16];
        wire[..5].copy_from_slice(b"uart\0");
        wire[10] = 0xAA;
        let (name, _): (NameBuf<16>, usize) =
            bincode::decode_from_slice(&wire, wire_config()).unwrap();
        assert_eq!(&*name, "uart");
        assert_eq!(name.as_wire()[10], 0);
    }

    #[test]
    fn identifier_matches_crc_of_terminated_name() {
        let name = NameBuf::<16>::try_from("carbon").unwrap();
        assert_eq!(name.identifier(), crate::crc::crc16(b"carbon\0"));
    }
}
