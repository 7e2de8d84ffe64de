use bitflags::bitflags;
use std::fmt;

use crate::containers::name::NameBuf;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::NAME_SIZE;

/// Size of the configuration record on the wire.
pub const CONFIGURATION_SIZE: usize = 24;

bitflags! {
    /// Device attribute word reported in the configuration record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u32 {
        /// Pointers and native ints are 32 bits wide.
        const WORD_32 = 1 << 0;
        /// Pointers and native ints are 16 bits wide.
        const WORD_16 = 1 << 1;
        const LITTLE_ENDIAN = 1 << 2;
    }
}

impl Attributes {
    /// The word width the attribute bits declare. 32-bit wins if a device
    /// reports both.
    pub fn width(&self) -> Option<Width> {
        if self.contains(Attributes::WORD_32) {
            Some(Width::Bits32)
        } else if self.contains(Attributes::WORD_16) {
            Some(Width::Bits16)
        } else {
            None
        }
    }
}

/// Word width of the device, used to size `int` and `ptr` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bits16,
    Bits32,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::Bits16 => 2,
            Width::Bits32 => 4,
        }
    }
}

/// The device's self-description record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    name: NameBuf<NAME_SIZE>,
    identifier: u16,
    version: u16,
    attributes: Attributes,
}

impl Configuration {
    pub fn new(name: &str, version: u16, attributes: Attributes) -> Result<Self> {
        let name = NameBuf::try_from(name)?;
        let identifier = name.identifier();
        Ok(Self {
            name,
            identifier,
            version,
            attributes,
        })
    }

    /// Replaces the computed identifier, for standing in as a device that
    /// reports something other than the hash of its name.
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn identifier(&self) -> u16 {
        self.identifier
    }

    pub const fn version(&self) -> u16 {
        self.version
    }

    pub const fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn to_bytes(&self) -> Result<[u8; CONFIGURATION_SIZE]> {
        let mut buf = [0u8; CONFIGURATION_SIZE];
        bincode::encode_into_slice(*self, &mut buf, crate::packet::wire_config())?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (config, _) = bincode::decode_from_slice(bytes, crate::packet::wire_config())?;
        Ok(config)
    }
}

impl bincode::Encode for Configuration {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> std::result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.name, encoder)?;
        bincode::Encode::encode(&self.identifier, encoder)?;
        bincode::Encode::encode(&self.version, encoder)?;
        bincode::Encode::encode(&self.attributes.bits(), encoder)
    }
}

impl<Context> bincode::Decode<Context> for Configuration {
    fn decode<D: bincode::de::Decoder>(
        decoder: &mut D,
    ) -> std::result::Result<Self, bincode::error::DecodeError> {
        let name = bincode::Decode::decode(decoder)?;
        let identifier = bincode::Decode::decode(decoder)?;
        let version = bincode::Decode::decode(decoder)?;
        let raw: u32 = bincode::Decode::decode(decoder)?;
        Ok(Self {
            name,
            identifier,
            version,
            // Unknown attribute bits are carried through untouched.
            attributes: Attributes::from_bits_retain(raw),
        })
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for Configuration {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de>>(
        decoder: &mut D,
    ) -> std::result::Result<Self, bincode::error::DecodeError> {
        bincode::Decode::decode(decoder)
    }
}

/// Opaque handle to a device held in the runtime's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

/// An attached (or attachable) device: its configuration record and the
/// endpoint that moves bytes to it. The device owns the endpoint.
pub struct Device {
    configuration: Configuration,
    endpoint: Option<Box<dyn Endpoint>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("configuration", &self.configuration)
            .field("endpoint", &self.endpoint.as_ref().map(|_| "<endpoint>"))
            .finish()
    }
}

impl Device {
    /// Creates an unattached device record. The identifier is computed
    /// from the name; no endpoint is assigned yet.
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            configuration: Configuration::new(name, 0, Attributes::empty())?,
            endpoint: None,
        })
    }

    pub fn name(&self) -> &str {
        self.configuration.name()
    }

    pub const fn identifier(&self) -> u16 {
        self.configuration.identifier()
    }

    pub const fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn width(&self) -> Option<Width> {
        self.configuration.attributes().width()
    }

    pub(crate) fn set_configuration(&mut self, configuration: Configuration) {
        self.configuration = configuration;
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: Box<dyn Endpoint>) {
        self.endpoint = Some(endpoint);
    }

    pub(crate) fn take_endpoint(&mut self) -> Option<Box<dyn Endpoint>> {
        self.endpoint.take()
    }

    pub(crate) fn endpoint_mut(&mut self) -> Result<&mut dyn Endpoint> {
        match self.endpoint.as_deref_mut() {
            Some(endpoint) => Ok(endpoint),
            None => Err(Error::new(
                ErrorKind::Endpoint,
                format!("device '{}' has no endpoint", self.configuration.name()),
            )),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Last-chance cleanup; detach is the explicit release path.
        if let Some(endpoint) = self.endpoint.as_deref_mut() {
            let _ = endpoint.destroy();
        }
    }
}
