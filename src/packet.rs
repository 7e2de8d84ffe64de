//! The packet codec.
//!
//! Every request travels in a fixed 64-byte envelope; only the first
//! `length` bytes are meaningful but the whole envelope is always
//! transmitted. All multi-byte fields are little-endian.
//!
//! Envelope layout:
//!
//! ```text
//! offset  size  field
//!  0      1     magic     = 0xFE
//!  1      2     checksum  (CRC-16; zeroed while computing)
//!  3      2     length    (bytes populated, including the header)
//!  5      1     class
//!  6      ..    class-specific body
//! ```
//!
//! An invocation body is a call record; a transfer body (push, pull, send,
//! receive, ram_load) is a `u32` payload length followed by a call record:
//!
//! ```text
//! size  field
//!  1    index      (module index; high bit flags a user invocation)
//!  1    function
//!  1    ret        (declared return type tag)
//!  1    argc
//!  4    types      (one low nibble per argument, nibble i for arg i)
//!  ..   parameters (packed little-endian values, in order)
//! ```
//!
//! A configuration request is a bare header. Every request is answered by
//! a 9-byte result frame: a `u64` value and an error byte.
//!
//! The checksum covers the first `length` bytes of the envelope with the
//! checksum field itself zeroed, so both peers compute over identical
//! bytes.

use crate::args::{ArgList, Type};
use crate::crc::crc16;
use crate::device::Width;
use crate::error::{Error, ErrorKind, Result};

/// Size of the request envelope on the wire.
pub const PACKET_SIZE: usize = 64;

/// First byte of every packet.
pub const MAGIC: u8 = 0xFE;

/// Size of the result frame on the wire.
pub const RESULT_SIZE: usize = 9;

pub(crate) const HEADER_SIZE: usize = 6;
pub(crate) const CALL_SIZE: usize = 8;

/// Nibble slots available in the packed type vector.
pub(crate) const TYPE_NIBBLES: usize = 8;

pub(crate) fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

/// Packet class codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Class {
    Configuration = 0,
    StandardCall = 1,
    UserCall = 2,
    Push = 3,
    Pull = 4,
    Send = 5,
    Receive = 6,
    RamLoad = 7,
    /// Reserved. Never emitted by the host, rejected when decoded.
    Event = 8,
}

impl Class {
    pub const fn code(self) -> u8 {
        self as u8
    }

    const fn is_invocation(self) -> bool {
        matches!(self, Class::StandardCall | Class::UserCall)
    }

    const fn is_transfer(self) -> bool {
        matches!(
            self,
            Class::Push | Class::Pull | Class::Send | Class::Receive | Class::RamLoad
        )
    }
}

impl TryFrom<u8> for Class {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let class = match value {
            0 => Self::Configuration,
            1 => Self::StandardCall,
            2 => Self::UserCall,
            3 => Self::Push,
            4 => Self::Pull,
            5 => Self::Send,
            6 => Self::Receive,
            7 => Self::RamLoad,
            8 => Self::Event,
            _ => {
                return Err(Error::new(
                    ErrorKind::Subclass,
                    format!("0x{value:02x} is not a packet class"),
                ))
            }
        };
        Ok(class)
    }
}

#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct Header {
    magic: u8,
    checksum: u16,
    length: u16,
    class: u8,
}

#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct Call {
    index: u8,
    function: u8,
    ret: u8,
    argc: u8,
    types: u32,
}

/// The fixed-size response to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ResultFrame {
    value: u64,
    error: u8,
}

impl ResultFrame {
    pub const fn new(value: u64, error: ErrorKind) -> Self {
        Self {
            value,
            error: error.code(),
        }
    }

    pub const fn value(&self) -> u64 {
        self.value
    }

    pub fn error_kind(&self) -> ErrorKind {
        ErrorKind::from_wire(self.error)
    }

    pub fn to_bytes(&self) -> Result<[u8; RESULT_SIZE]> {
        let mut buf = [0u8; RESULT_SIZE];
        bincode::encode_into_slice(*self, &mut buf, wire_config())?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (frame, _) = bincode::decode_from_slice(bytes, wire_config())?;
        Ok(frame)
    }
}

/// A decoded call record: target coordinates plus the recovered argument
/// list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub index: u8,
    pub function: u8,
    pub ret: Type,
    pub args: ArgList,
}

/// A decoded request packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Ask the device to describe itself.
    Configuration,
    /// Invoke an indexed function (standard or user module).
    Invocation { class: Class, call: CallRecord },
    /// Announce a bulk transfer of `length` payload bytes, optionally
    /// dispatching a device-side function around it.
    Transfer {
        class: Class,
        length: u32,
        call: CallRecord,
    },
}

/// Encodes a configuration request: a bare, checksummed header.
pub fn encode_configuration() -> Result<[u8; PACKET_SIZE]> {
    let mut buf = [0u8; PACKET_SIZE];
    seal(&mut buf, Class::Configuration, HEADER_SIZE as u16)?;
    Ok(buf)
}

/// Encodes a standard or user invocation.
pub fn encode_invocation(
    class: Class,
    index: u8,
    function: u8,
    ret: Type,
    args: &ArgList,
    width: Option<Width>,
) -> Result<[u8; PACKET_SIZE]> {
    if !class.is_invocation() {
        return Err(Error::new(
            ErrorKind::Subclass,
            format!("{class:?} is not an invocation class"),
        ));
    }
    let mut buf = [0u8; PACKET_SIZE];
    let length = encode_call(&mut buf, HEADER_SIZE, index, function, ret, args, width)?;
    seal(&mut buf, class, length)?;
    Ok(buf)
}

/// Encodes a transfer announcement (push, pull, send, receive, ram_load)
/// for `length` payload bytes.
pub fn encode_transfer(
    class: Class,
    length: u32,
    index: u8,
    function: u8,
    ret: Type,
    args: &ArgList,
    width: Option<Width>,
) -> Result<[u8; PACKET_SIZE]> {
    if !class.is_transfer() {
        return Err(Error::new(
            ErrorKind::Subclass,
            format!("{class:?} is not a transfer class"),
        ));
    }
    let mut buf = [0u8; PACKET_SIZE];
    buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&length.to_le_bytes());
    let packet_length = encode_call(&mut buf, HEADER_SIZE + 4, index, function, ret, args, width)?;
    seal(&mut buf, class, packet_length)?;
    Ok(buf)
}

/// Validates and decodes a request envelope.
pub fn decode(bytes: &[u8], width: Option<Width>) -> Result<Packet> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::new(ErrorKind::Fmr, "packet is shorter than a header"));
    }
    let (header, _): (Header, usize) =
        bincode::decode_from_slice(&bytes[..HEADER_SIZE], wire_config())?;
    if header.magic != MAGIC {
        return Err(Error::new(
            ErrorKind::Checksum,
            format!("bad magic number (0x{:02x})", header.magic),
        ));
    }
    // The checksum is verified first, over a clamped range, so that a
    // corrupted length byte still surfaces as a checksum failure; only a
    // packet that checksums clean gets held to the strict length range.
    let length = header.length as usize;
    let bounded = length.min(PACKET_SIZE).min(bytes.len());
    let mut shadow = [0u8; PACKET_SIZE];
    shadow[..bounded].copy_from_slice(&bytes[..bounded]);
    shadow[1] = 0;
    shadow[2] = 0;
    if crc16(&shadow[..bounded]) != header.checksum {
        return Err(Error::new(ErrorKind::Checksum, "checksums do not match"));
    }
    if length < HEADER_SIZE || length > PACKET_SIZE || length > bytes.len() {
        return Err(Error::new(
            ErrorKind::Fmr,
            format!("bad packet length ({length} bytes)"),
        ));
    }

    let class = Class::try_from(header.class)?;
    match class {
        Class::Configuration => Ok(Packet::Configuration),
        Class::StandardCall | Class::UserCall => {
            let call = decode_call(bytes, HEADER_SIZE, length, width)?;
            Ok(Packet::Invocation { class, call })
        }
        Class::Push | Class::Pull | Class::Send | Class::Receive | Class::RamLoad => {
            if length < HEADER_SIZE + 4 + CALL_SIZE {
                return Err(Error::new(
                    ErrorKind::Fmr,
                    format!("bad packet length ({length} bytes) for a transfer"),
                ));
            }
            let transfer_length =
                u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
            let call = decode_call(bytes, HEADER_SIZE + 4, length, width)?;
            Ok(Packet::Transfer {
                class,
                length: transfer_length,
                call,
            })
        }
        Class::Event => Err(Error::new(
            ErrorKind::Subclass,
            "event packets are reserved",
        )),
    }
}

/// Packs the call record and its parameter area at `offset`, returning the
/// resulting packet length.
fn encode_call(
    buf: &mut [u8; PACKET_SIZE],
    offset: usize,
    index: u8,
    function: u8,
    ret: Type,
    args: &ArgList,
    width: Option<Width>,
) -> Result<u16> {
    let mut types: u32 = 0;
    let mut cursor = offset + CALL_SIZE;
    for (i, arg) in args.iter().enumerate() {
        if i >= TYPE_NIBBLES {
            return Err(Error::new(
                ErrorKind::Overflow,
                format!("only {TYPE_NIBBLES} arguments fit the packed type vector"),
            ));
        }
        let size = arg.kind().size(width)?;
        if cursor + size > PACKET_SIZE {
            return Err(Error::new(
                ErrorKind::Overflow,
                "parameter area overflows the packet",
            ));
        }
        types |= ((arg.kind().tag() & 0x0F) as u32) << (i * 4);
        buf[cursor..cursor + size].copy_from_slice(&arg.value().to_le_bytes()[..size]);
        cursor += size;
    }
    let call = Call {
        index,
        function,
        ret: ret.tag(),
        argc: args.len() as u8,
        types,
    };
    bincode::encode_into_slice(call, &mut buf[offset..offset + CALL_SIZE], wire_config())?;
    Ok(cursor as u16)
}

fn decode_call(
    bytes: &[u8],
    offset: usize,
    length: usize,
    width: Option<Width>,
) -> Result<CallRecord> {
    if length < offset + CALL_SIZE {
        return Err(Error::new(
            ErrorKind::Fmr,
            format!("bad packet length ({length} bytes) for a call record"),
        ));
    }
    let (call, _): (Call, usize) =
        bincode::decode_from_slice(&bytes[offset..offset + CALL_SIZE], wire_config())?;
    if call.argc as usize > TYPE_NIBBLES {
        return Err(Error::new(
            ErrorKind::Fmr,
            format!("argument count {} exceeds the type vector", call.argc),
        ));
    }
    let ret = Type::try_from(call.ret)
        .map_err(|_| bad_type(call.ret))?;
    let mut args = ArgList::new();
    let mut cursor = offset + CALL_SIZE;
    for i in 0..call.argc as usize {
        let nibble = ((call.types >> (i * 4)) & 0x0F) as u8;
        let kind = Type::try_from(nibble).map_err(|_| bad_type(nibble))?;
        let size = kind.size(width)?;
        if cursor + size > length {
            return Err(Error::new(
                ErrorKind::Fmr,
                "parameter area exceeds the packet length",
            ));
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes[cursor..cursor + size]);
        args.append(u64::from_le_bytes(raw), kind)?;
        cursor += size;
    }
    Ok(CallRecord {
        index: call.index,
        function: call.function,
        ret,
        args,
    })
}

fn bad_type(tag: u8) -> Error {
    Error::new(ErrorKind::Type, format!("0x{tag:02x} is not a type tag"))
}

fn seal(buf: &mut [u8; PACKET_SIZE], class: Class, length: u16) -> Result<()> {
    let header = Header {
        magic: MAGIC,
        checksum: 0,
        length,
        class: class.code(),
    };
    bincode::encode_into_slice(header, &mut buf[..HEADER_SIZE], wire_config())?;
    let checksum = crc16(&buf[..length as usize]);
    buf[1..3].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Arg;

    fn led_args() -> ArgList {
        let mut args = ArgList::new();
        args.push(Arg::from(10u8)).unwrap();
        args.push(Arg::from(20u8)).unwrap();
        args.push(Arg::from(30u8)).unwrap();
        args
    }

    #[test]
    fn invocation_wire_layout() {
        let buf =
            encode_invocation(Class::StandardCall, 5, 0, Type::Void, &led_args(), None).unwrap();

        assert_eq!(buf[0], MAGIC);
        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), 17);
        assert_eq!(buf[5], Class::StandardCall.code());
        // index, function, ret, argc
        assert_eq!(&buf[6..10], &[0x05, 0x00, 0x02, 0x03]);
        // u8 arguments pack zero nibbles
        assert_eq!(u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]), 0);
        assert_eq!(&buf[14..17], &[0x0A, 0x14, 0x1E]);
        // nothing past the populated length
        assert!(buf[17..].iter().all(|&b| b == 0));

        let mut shadow = buf;
        shadow[1] = 0;
        shadow[2] = 0;
        assert_eq!(
            u16::from_le_bytes([buf[1], buf[2]]),
            crc16(&shadow[..17])
        );
    }

    #[test]
    fn invocation_round_trips() {
        let mut args = ArgList::new();
        args.push(Arg::from(0x0A0Bu16)).unwrap();
        args.push(Arg::from(-1i32)).unwrap();
        args.push(Arg::new(Type::Ptr, 0x2000_0000)).unwrap();
        let buf = encode_invocation(
            Class::UserCall,
            0x85,
            3,
            Type::U32,
            &args,
            Some(Width::Bits32),
        )
        .unwrap();

        let packet = decode(&buf, Some(Width::Bits32)).unwrap();
        match packet {
            Packet::Invocation { class, call } => {
                assert_eq!(class, Class::UserCall);
                assert_eq!(call.index, 0x85);
                assert_eq!(call.function, 3);
                assert_eq!(call.ret, Type::U32);
                assert_eq!(call.args, args);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn transfer_round_trips() {
        let mut args = ArgList::new();
        args.push(Arg::new(Type::Ptr, 0xDEAD_BEEF)).unwrap();
        args.push(Arg::from(256u32)).unwrap();
        args.push(Arg::from(0u32)).unwrap();
        let buf = encode_transfer(
            Class::Push,
            256,
            9,
            1,
            Type::Void,
            &args,
            Some(Width::Bits32),
        )
        .unwrap();

        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), (6 + 4 + 8 + 12) as u16);
        assert_eq!(u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]), 256);

        match decode(&buf, Some(Width::Bits32)).unwrap() {
            Packet::Transfer {
                class,
                length,
                call,
            } => {
                assert_eq!(class, Class::Push);
                assert_eq!(length, 256);
                assert_eq!(call.args, args);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn configuration_is_a_bare_header() {
        let buf = encode_configuration().unwrap();
        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), HEADER_SIZE as u16);
        assert_eq!(decode(&buf, None).unwrap(), Packet::Configuration);
    }

    #[test]
    fn any_flipped_byte_fails_the_checksum() {
        let buf =
            encode_invocation(Class::StandardCall, 5, 0, Type::Void, &led_args(), None).unwrap();
        // Positions 3 and 4 corrupt the length field itself; the clamped
        // checksum pass catches those too.
        for position in [0usize, 3, 4, 5, 6, 14, 16] {
            let mut corrupt = buf;
            corrupt[position] ^= 0x40;
            let err = decode(&corrupt, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Checksum, "byte {position}");
        }
    }

    #[test]
    fn unknown_class_is_a_subclass_error() {
        let mut buf = encode_configuration().unwrap();
        buf[5] = 0x2A;
        let checksum = {
            let mut shadow = buf;
            shadow[1] = 0;
            shadow[2] = 0;
            crc16(&shadow[..HEADER_SIZE])
        };
        buf[1..3].copy_from_slice(&checksum.to_le_bytes());
        let err = decode(&buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Subclass);
    }

    #[test]
    fn event_class_is_reserved() {
        let mut buf = encode_configuration().unwrap();
        buf[5] = Class::Event.code();
        let checksum = {
            let mut shadow = buf;
            shadow[1] = 0;
            shadow[2] = 0;
            crc16(&shadow[..HEADER_SIZE])
        };
        buf[1..3].copy_from_slice(&checksum.to_le_bytes());
        let err = decode(&buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Subclass);
    }

    // A length out of range only reaches the length check when the packet
    // checksums clean, so these reseal after changing the field.
    #[test]
    fn bad_length_is_an_fmr_error() {
        let mut buf = encode_configuration().unwrap();
        buf[3] = 0xFF;
        buf[4] = 0x00;
        let checksum = {
            let mut shadow = buf;
            shadow[1] = 0;
            shadow[2] = 0;
            crc16(&shadow[..PACKET_SIZE])
        };
        buf[1..3].copy_from_slice(&checksum.to_le_bytes());
        let err = decode(&buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fmr);
    }

    #[test]
    fn length_shorter_than_a_header_is_an_fmr_error() {
        let mut buf = encode_configuration().unwrap();
        buf[3] = 0x03;
        buf[4] = 0x00;
        let checksum = {
            let mut shadow = buf;
            shadow[1] = 0;
            shadow[2] = 0;
            crc16(&shadow[..3])
        };
        buf[1..3].copy_from_slice(&checksum.to_le_bytes());
        let err = decode(&buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fmr);
    }

    #[test]
    fn bad_return_tag_is_a_type_error() {
        let buf =
            encode_invocation(Class::StandardCall, 5, 0, Type::Void, &ArgList::new(), None)
                .unwrap();
        let mut corrupt = buf;
        corrupt[8] = 0x05; // not a type tag
        let checksum = {
            let mut shadow = corrupt;
            shadow[1] = 0;
            shadow[2] = 0;
            crc16(&shadow[..14])
        };
        corrupt[1..3].copy_from_slice(&checksum.to_le_bytes());
        let err = decode(&corrupt, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn nine_arguments_refuse_to_pack() {
        let mut args = ArgList::new();
        for i in 0..9u8 {
            args.push(Arg::from(i)).unwrap();
        }
        let err = encode_invocation(Class::StandardCall, 1, 0, Type::Void, &args, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn oversized_parameter_area_refuses_to_pack() {
        let mut args = ArgList::new();
        for _ in 0..7 {
            args.push(Arg::from(u64::MAX)).unwrap();
        }
        // 7 * 8 = 56 parameter bytes; 6 + 8 + 56 > 64.
        let err = encode_invocation(Class::StandardCall, 1, 0, Type::Void, &args, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn sixteen_bit_pointers_shrink_the_parameter_area() {
        let mut args = ArgList::new();
        args.push(Arg::new(Type::Ptr, 0x1234)).unwrap();
        let buf = encode_invocation(
            Class::StandardCall,
            2,
            1,
            Type::Void,
            &args,
            Some(Width::Bits16),
        )
        .unwrap();
        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), (6 + 8 + 2) as u16);
        assert_eq!(&buf[14..16], &[0x34, 0x12]);
    }

    #[test]
    fn result_frame_round_trips() {
        let frame = ResultFrame::new(0x1122_3344_5566_7788, ErrorKind::Module);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), RESULT_SIZE);
        assert_eq!(&bytes[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(bytes[8], ErrorKind::Module.code());
        assert_eq!(ResultFrame::from_bytes(&bytes).unwrap(), frame);
    }
}
