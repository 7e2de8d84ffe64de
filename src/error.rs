use core::fmt;

/// The error taxonomy shared between the host and the device.
///
/// Discriminants are the wire codes carried in the error byte of a result
/// frame, so a device-reported failure translates directly into the host
/// taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    Ok = 0,
    Null = 1,
    Malloc = 2,
    Name = 3,
    Endpoint = 4,
    NoDevice = 5,
    Module = 6,
    Type = 7,
    Checksum = 8,
    Subclass = 9,
    Fmr = 10,
    Overflow = 11,
    Invocation = 12,
    IndexOutOfBounds = 13,
    IllegalHandle = 14,
    IllegalType = 15,
    PackageNotLoaded = 16,
    Test = 17,
}

impl ErrorKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Translates an error byte reported by the device. Codes outside the
    /// taxonomy collapse to [`ErrorKind::Fmr`].
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Null,
            2 => Self::Malloc,
            3 => Self::Name,
            4 => Self::Endpoint,
            5 => Self::NoDevice,
            6 => Self::Module,
            7 => Self::Type,
            8 => Self::Checksum,
            9 => Self::Subclass,
            10 => Self::Fmr,
            11 => Self::Overflow,
            12 => Self::Invocation,
            13 => Self::IndexOutOfBounds,
            14 => Self::IllegalHandle,
            15 => Self::IllegalType,
            16 => Self::PackageNotLoaded,
            17 => Self::Test,
            _ => Self::Fmr,
        }
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::Null => "null",
            ErrorKind::Malloc => "malloc",
            ErrorKind::Name => "name",
            ErrorKind::Endpoint => "endpoint",
            ErrorKind::NoDevice => "no_device",
            ErrorKind::Module => "module",
            ErrorKind::Type => "type",
            ErrorKind::Checksum => "checksum",
            ErrorKind::Subclass => "subclass",
            ErrorKind::Fmr => "fmr",
            ErrorKind::Overflow => "overflow",
            ErrorKind::Invocation => "invocation",
            ErrorKind::IndexOutOfBounds => "index_out_of_bounds",
            ErrorKind::IllegalHandle => "illegal_handle",
            ErrorKind::IllegalType => "illegal_type",
            ErrorKind::PackageNotLoaded => "package_not_loaded",
            ErrorKind::Test => "test",
        };
        f.write_str(name)
    }
}

/// A classified failure with a human-readable message.
///
/// Every fallible entry point of the runtime produces one of these; the
/// runtime additionally mirrors it into its last-error slot before handing
/// it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for Error {}

impl From<bincode::error::EncodeError> for Error {
    fn from(value: bincode::error::EncodeError) -> Self {
        Self::new(ErrorKind::Fmr, format!("failed to encode record: {value}"))
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(value: bincode::error::DecodeError) -> Self {
        Self::new(ErrorKind::Fmr, format!("failed to decode record: {value}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in 0..=17u8 {
            assert_eq!(ErrorKind::from_wire(code).code(), code);
        }
    }

    #[test]
    fn unknown_wire_code_collapses() {
        assert_eq!(ErrorKind::from_wire(0x5A), ErrorKind::Fmr);
    }
}
