use crate::containers::name::NameBuf;
use crate::device::DeviceId;
use crate::error::Result;
use crate::NAME_SIZE;

/// High bit of the wire index, set for invocations into user-loaded
/// modules.
pub const USER_BIT: u8 = 0x80;

/// Module index of the device-side loader that answers bind lookups.
pub(crate) const LOADER_INDEX: u8 = 0;
/// Function index of the loader's lookup-by-identifier entry.
pub(crate) const LOADER_LOOKUP: u8 = 0;
/// Loader reply meaning "no counterpart module is loaded".
pub(crate) const UNBOUND_SENTINEL: u64 = 0xFFFF_FFFF;

/// Opaque handle to a module held in the runtime's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) u32);

/// A resolved module: the device it was bound against and its index in
/// that device's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub device: DeviceId,
    pub index: u8,
}

/// A named group of indexed device-side functions.
///
/// A module starts out unbound; binding resolves its identifier against
/// the selected device and fills in the index. The device edge is a
/// registry handle, never a pointer, so a detached device simply stops
/// resolving.
#[derive(Debug, Clone)]
pub struct Module {
    name: NameBuf<NAME_SIZE>,
    identifier: u16,
    user: bool,
    binding: Option<Binding>,
}

impl Module {
    pub fn create(name: &str, user: bool) -> Result<Self> {
        let name = NameBuf::try_from(name)?;
        let identifier = name.identifier();
        Ok(Self {
            name,
            identifier,
            user,
            binding: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn identifier(&self) -> u16 {
        self.identifier
    }

    pub const fn user(&self) -> bool {
        self.user
    }

    pub const fn binding(&self) -> Option<Binding> {
        self.binding
    }

    pub const fn bound(&self) -> bool {
        self.binding.is_some()
    }

    /// The index as it appears on the wire, with the user bit applied.
    pub(crate) fn wire_index(&self, index: u8) -> u8 {
        if self.user {
            index | USER_BIT
        } else {
            index
        }
    }

    pub(crate) fn set_binding(&mut self, binding: Binding) {
        self.binding = Some(binding);
    }

    pub(crate) fn clear_binding(&mut self) {
        self.binding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn create_computes_identifier() {
        let module = Module::create("button", false).unwrap();
        assert_eq!(module.identifier(), crate::crc::identifier("button"));
        assert!(!module.bound());
    }

    #[test]
    fn over_long_name_is_rejected() {
        let err = Module::create("a-very-long-module-name", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Name);
    }

    #[test]
    fn user_bit_applies_on_the_wire() {
        let module = Module::create("qux", true).unwrap();
        assert_eq!(module.wire_index(3), 0x83);
        let module = Module::create("led", false).unwrap();
        assert_eq!(module.wire_index(3), 0x03);
    }
}
