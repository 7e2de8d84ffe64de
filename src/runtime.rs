use std::collections::HashMap;

use log::{debug, info, trace, warn};

use crate::args::{Arg, ArgList, Type};
use crate::device::{Configuration, Device, DeviceId, Width, CONFIGURATION_SIZE};
use crate::endpoint::network::NetworkEndpoint;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::module::{Binding, Module, ModuleId, LOADER_INDEX, LOADER_LOOKUP, UNBOUND_SENTINEL};
use crate::packet::{self, Class, ResultFrame, PACKET_SIZE, RESULT_SIZE};

/// The runtime context: the device registry, the module table, the
/// selected-device slot and the last-error slot.
///
/// All methods take `&mut self`, so a single runtime serializes transport
/// use, binding mutation and error reporting by construction;
/// multi-threaded callers wrap it in a lock of their choosing.
///
/// Dropping the runtime tears down any endpoint that is still attached;
/// [`shutdown`] is the explicit form.
///
/// [`shutdown`]: Runtime::shutdown
pub struct Runtime {
    devices: HashMap<DeviceId, Device>,
    modules: HashMap<ModuleId, Module>,
    selected: Option<DeviceId>,
    last_error: Option<Error>,
    next_device: u32,
    next_module: u32,
}

/// Direction of the bulk bytes that follow a transfer announcement.
enum Payload<'a> {
    None,
    Outbound(&'a [u8]),
    Inbound(&'a mut [u8]),
}

/// A resolved invocation target.
struct Target {
    name: String,
    binding: Binding,
    wire_index: u8,
    user: bool,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
            modules: HashMap::new(),
            selected: None,
            last_error: None,
            next_device: 0,
            next_module: 0,
        }
    }

    // --- error channel ---

    /// The most recent failure raised by this runtime, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    fn raise(&mut self, error: Error) -> Error {
        warn!("{error}");
        self.last_error = Some(error.clone());
        error
    }

    fn surface<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.raise(err))
    }

    // --- device registry ---

    /// Attaches the factory-default device over USB.
    #[cfg(feature = "usb")]
    pub fn attach(&mut self) -> Result<DeviceId> {
        self.attach_usb(crate::DEFAULT_DEVICE_NAME)
    }

    /// Attaches the USB device with the given product name and selects it.
    #[cfg(feature = "usb")]
    pub fn attach_usb(&mut self, name: &str) -> Result<DeviceId> {
        let endpoint = Box::new(crate::endpoint::usb::UsbEndpoint::new());
        let result = self.attach_inner(name, endpoint, Some(name));
        self.surface(result)
    }

    /// Dials a networked device at `host` (port 3258 unless given) and
    /// selects it.
    pub fn attach_network(&mut self, name: &str, host: &str) -> Result<DeviceId> {
        let endpoint = Box::new(NetworkEndpoint::new());
        let result = self.attach_inner(name, endpoint, Some(host));
        self.surface(result)
    }

    /// Attaches over a caller-supplied, already-connected endpoint and
    /// selects the device.
    pub fn attach_endpoint(&mut self, name: &str, endpoint: Box<dyn Endpoint>) -> Result<DeviceId> {
        let result = self.attach_inner(name, endpoint, None);
        self.surface(result)
    }

    fn attach_inner(
        &mut self,
        name: &str,
        mut endpoint: Box<dyn Endpoint>,
        hint: Option<&str>,
    ) -> Result<DeviceId> {
        let mut device = Device::create(name)?;
        if let Some(hint) = hint {
            if let Err(err) = endpoint.configure(hint) {
                let _ = endpoint.destroy();
                return Err(Error::new(
                    ErrorKind::Endpoint,
                    format!(
                        "failed to initialize endpoint for device '{name}': {}",
                        err.message()
                    ),
                ));
            }
        }
        device.set_endpoint(endpoint);
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        self.devices.insert(id, device);
        self.selected = Some(id);
        info!("attached device '{name}'");
        Ok(id)
    }

    /// Makes `device` the target of subsequent binds.
    pub fn select(&mut self, device: DeviceId) -> Result<()> {
        if !self.devices.contains_key(&device) {
            return Err(self.raise(no_device(device)));
        }
        self.selected = Some(device);
        Ok(())
    }

    pub const fn selected(&self) -> Option<DeviceId> {
        self.selected
    }

    pub fn device(&self, device: DeviceId) -> Option<&Device> {
        self.devices.get(&device)
    }

    /// Destroys the device's endpoint, removes it from the registry and
    /// unbinds every module that was bound to it.
    pub fn detach(&mut self, device: DeviceId) -> Result<()> {
        let mut record = match self.devices.remove(&device) {
            Some(record) => record,
            None => return Err(self.raise(no_device(device))),
        };
        if let Some(mut endpoint) = record.take_endpoint() {
            if let Err(err) = endpoint.destroy() {
                warn!("failed to destroy endpoint of '{}': {err}", record.name());
            }
        }
        if self.selected == Some(device) {
            self.selected = None;
        }
        for module in self.modules.values_mut() {
            if module.binding().map(|binding| binding.device) == Some(device) {
                module.clear_binding();
            }
        }
        info!("detached device '{}'", record.name());
        Ok(())
    }

    /// Tears down every remaining device. Also runs from `Drop` as a
    /// last-chance cleanup.
    pub fn shutdown(&mut self) -> Result<()> {
        self.selected = None;
        for (_, mut record) in self.devices.drain() {
            if let Some(mut endpoint) = record.take_endpoint() {
                let _ = endpoint.destroy();
            }
        }
        for module in self.modules.values_mut() {
            module.clear_binding();
        }
        Ok(())
    }

    // --- module table ---

    /// Returns the handle for the named module, creating the record on
    /// first use. The module starts out unbound.
    pub fn module(&mut self, name: &str) -> Result<ModuleId> {
        let result = self.module_inner(name, false);
        self.surface(result)
    }

    /// Like [`module`], for a dynamically loaded user module.
    ///
    /// [`module`]: Runtime::module
    pub fn user_module(&mut self, name: &str) -> Result<ModuleId> {
        let result = self.module_inner(name, true);
        self.surface(result)
    }

    fn module_inner(&mut self, name: &str, user: bool) -> Result<ModuleId> {
        for (id, module) in &self.modules {
            if module.name() == name && module.user() == user {
                return Ok(*id);
            }
        }
        let module = Module::create(name, user)?;
        let id = ModuleId(self.next_module);
        self.next_module += 1;
        self.modules.insert(id, module);
        Ok(id)
    }

    pub fn module_record(&self, module: ModuleId) -> Option<&Module> {
        self.modules.get(&module)
    }

    /// Resolves the module against the selected device: the device-side
    /// loader is asked for the index matching the module's identifier, and
    /// the result is cached in the module record. On failure the module
    /// stays unbound.
    pub fn bind(&mut self, module: ModuleId) -> Result<()> {
        let result = self.bind_inner(module);
        self.surface(result)
    }

    fn bind_inner(&mut self, module: ModuleId) -> Result<()> {
        let (name, identifier) = {
            let record = self.module_ref(module)?;
            (record.name().to_owned(), record.identifier())
        };
        let device_id = match self.selected {
            Some(id) => id,
            None => {
                return Err(Error::new(
                    ErrorKind::NoDevice,
                    format!("no device selected to bind module '{name}' against"),
                ))
            }
        };
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| no_device(device_id))?;
        let width = device.width();
        let mut args = ArgList::new();
        args.append(identifier as u64, Type::U16)?;
        let request = packet::encode_invocation(
            Class::StandardCall,
            LOADER_INDEX,
            LOADER_LOOKUP,
            Type::U32,
            &args,
            width,
        )?;
        let result = transact(device, &request, Payload::None)?;
        if result.value() == UNBOUND_SENTINEL {
            return Err(Error::new(
                ErrorKind::Module,
                format!("no counterpart module loaded for '{name}'"),
            ));
        }
        if result.value() > 0x7F {
            return Err(Error::new(
                ErrorKind::Module,
                format!(
                    "device returned an invalid index (0x{:x}) for module '{name}'",
                    result.value()
                ),
            ));
        }
        let index = result.value() as u8;
        debug!("bound module '{name}' to index {index}");
        if let Some(record) = self.modules.get_mut(&module) {
            record.set_binding(Binding {
                device: device_id,
                index,
            });
        }
        Ok(())
    }

    fn module_ref(&self, module: ModuleId) -> Result<&Module> {
        self.modules.get(&module).ok_or_else(|| {
            Error::new(
                ErrorKind::IllegalHandle,
                format!("{module:?} is not a module handle"),
            )
        })
    }

    fn resolve_target(&self, module: ModuleId) -> Result<Target> {
        let record = self.module_ref(module)?;
        let binding = record.binding().ok_or_else(|| {
            Error::new(
                ErrorKind::Module,
                format!("module '{}' has not been bound to a device", record.name()),
            )
        })?;
        Ok(Target {
            name: record.name().to_owned(),
            binding,
            wire_index: record.wire_index(binding.index),
            user: record.user(),
        })
    }

    fn bound_device(&mut self, target: &Target) -> Result<&mut Device> {
        self.devices.get_mut(&target.binding.device).ok_or_else(|| {
            Error::new(
                ErrorKind::NoDevice,
                format!("module '{}' is bound to a detached device", target.name),
            )
        })
    }

    // --- dispatch ---

    /// Invokes the function at `function` within the bound module,
    /// returning the result value cast down to the declared `ret` type.
    pub fn invoke(&mut self, module: ModuleId, function: u8, ret: Type, args: &ArgList) -> Result<u64> {
        let result = self.invoke_inner(module, function, ret, args);
        self.surface(result)
    }

    fn invoke_inner(
        &mut self,
        module: ModuleId,
        function: u8,
        ret: Type,
        args: &ArgList,
    ) -> Result<u64> {
        let target = self.resolve_target(module)?;
        let class = if target.user {
            Class::UserCall
        } else {
            Class::StandardCall
        };
        let device = self.bound_device(&target)?;
        let width = device.width();
        debug!(
            "invoke '{}'[{function}] with {} argument(s)",
            target.name,
            args.len()
        );
        let request =
            packet::encode_invocation(class, target.wire_index, function, ret, args, width)?;
        let result = transact(device, &request, Payload::None)?;
        cast_return(result.value(), ret, width)
    }

    /// Moves `source` into the device's address space and dispatches the
    /// module function over it.
    pub fn push(
        &mut self,
        module: ModuleId,
        function: u8,
        source: &[u8],
        args: &ArgList,
    ) -> Result<()> {
        let result = self.push_inner(module, function, source, args);
        self.surface(result)
    }

    fn push_inner(
        &mut self,
        module: ModuleId,
        function: u8,
        source: &[u8],
        args: &ArgList,
    ) -> Result<()> {
        let target = self.resolve_target(module)?;
        if source.is_empty() {
            return Ok(());
        }
        let device = self.bound_device(&target)?;
        let width = device.width();
        let merged = transfer_args(source.as_ptr() as u64, source.len(), args)?;
        debug!("push {} bytes to '{}'[{function}]", source.len(), target.name);
        let request = packet::encode_transfer(
            Class::Push,
            source.len() as u32,
            target.wire_index,
            function,
            Type::Void,
            &merged,
            width,
        )?;
        transact(device, &request, Payload::Outbound(source))?;
        Ok(())
    }

    /// Fills `destination` from the device's address space after
    /// dispatching the module function that produces the data.
    pub fn pull(
        &mut self,
        module: ModuleId,
        function: u8,
        destination: &mut [u8],
        args: &ArgList,
    ) -> Result<()> {
        let result = self.pull_inner(module, function, destination, args);
        self.surface(result)
    }

    fn pull_inner(
        &mut self,
        module: ModuleId,
        function: u8,
        destination: &mut [u8],
        args: &ArgList,
    ) -> Result<()> {
        let target = self.resolve_target(module)?;
        if destination.is_empty() {
            return Ok(());
        }
        let device = self.bound_device(&target)?;
        let width = device.width();
        let merged = transfer_args(destination.as_ptr() as u64, destination.len(), args)?;
        debug!(
            "pull {} bytes from '{}'[{function}]",
            destination.len(),
            target.name
        );
        let request = packet::encode_transfer(
            Class::Pull,
            destination.len() as u32,
            target.wire_index,
            function,
            Type::Void,
            &merged,
            width,
        )?;
        transact(device, &request, Payload::Inbound(destination))?;
        Ok(())
    }

    /// Copies `source` into the device's address space; the returned value
    /// is the device-side address of the copy.
    pub fn send(&mut self, device: DeviceId, source: &[u8]) -> Result<u64> {
        let result = self.send_inner(device, source);
        self.surface(result)
    }

    fn send_inner(&mut self, device: DeviceId, source: &[u8]) -> Result<u64> {
        if source.is_empty() {
            return Err(Error::new(ErrorKind::Null, "no data provided to send"));
        }
        let record = self
            .devices
            .get_mut(&device)
            .ok_or_else(|| no_device(device))?;
        let width = record.width();
        let merged = transfer_args(source.as_ptr() as u64, source.len(), &ArgList::new())?;
        debug!("send {} bytes to '{}'", source.len(), record.name());
        let request = packet::encode_transfer(
            Class::Send,
            source.len() as u32,
            0,
            0,
            Type::Void,
            &merged,
            width,
        )?;
        let result = transact(record, &request, Payload::Outbound(source))?;
        Ok(result.value())
    }

    /// Copies `length` bytes out of the device's address space, starting
    /// at the device-side address `source`.
    pub fn receive(&mut self, device: DeviceId, source: u64, length: usize) -> Result<Vec<u8>> {
        let result = self.receive_inner(device, source, length);
        self.surface(result)
    }

    fn receive_inner(&mut self, device: DeviceId, source: u64, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Err(Error::new(ErrorKind::Null, "no length provided to receive"));
        }
        let record = self
            .devices
            .get_mut(&device)
            .ok_or_else(|| no_device(device))?;
        let width = record.width();
        let merged = transfer_args(source, length, &ArgList::new())?;
        debug!("receive {length} bytes from '{}'", record.name());
        let request = packet::encode_transfer(
            Class::Receive,
            length as u32,
            0,
            0,
            Type::Void,
            &merged,
            width,
        )?;
        let mut destination = vec![0u8; length];
        transact(record, &request, Payload::Inbound(&mut destination))?;
        Ok(destination)
    }

    /// Loads an image into the device's RAM.
    pub fn load(&mut self, device: DeviceId, image: &[u8]) -> Result<()> {
        let result = self.load_inner(device, image);
        self.surface(result)
    }

    fn load_inner(&mut self, device: DeviceId, image: &[u8]) -> Result<()> {
        if image.is_empty() {
            return Ok(());
        }
        let record = self
            .devices
            .get_mut(&device)
            .ok_or_else(|| no_device(device))?;
        let width = record.width();
        let merged = transfer_args(image.as_ptr() as u64, image.len(), &ArgList::new())?;
        debug!("load {} bytes into '{}'", image.len(), record.name());
        let request = packet::encode_transfer(
            Class::RamLoad,
            image.len() as u32,
            0,
            0,
            Type::Void,
            &merged,
            width,
        )?;
        transact(record, &request, Payload::Outbound(image))?;
        Ok(())
    }

    /// Asks the device to describe itself, verifies that the reported
    /// identifier matches the host-computed one, and copies the record
    /// into the device.
    pub fn configuration(&mut self, device: DeviceId) -> Result<Configuration> {
        let result = self.configuration_inner(device);
        self.surface(result)
    }

    fn configuration_inner(&mut self, device: DeviceId) -> Result<Configuration> {
        let record = self
            .devices
            .get_mut(&device)
            .ok_or_else(|| no_device(device))?;
        let expected = record.identifier();
        let name = record.name().to_owned();
        let request = packet::encode_configuration()?;
        let mut raw = [0u8; CONFIGURATION_SIZE];
        transact(record, &request, Payload::Inbound(&mut raw))?;
        let reported = Configuration::from_bytes(&raw)?;
        if reported.identifier() != expected {
            return Err(Error::new(
                ErrorKind::NoDevice,
                format!(
                    "identifier mismatch for device '{name}' (0x{:04x} instead of 0x{:04x})",
                    reported.identifier(),
                    expected
                ),
            ));
        }
        record.set_configuration(reported);
        debug!(
            "configuration for '{name}': version 0x{:04x}, attributes {:?}",
            reported.version(),
            reported.attributes()
        );
        Ok(reported)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Synthesizes the leading `(ptr, u32)` pair every transfer carries, then
/// appends the caller's arguments.
fn transfer_args(address: u64, length: usize, extra: &ArgList) -> Result<ArgList> {
    if length > u32::MAX as usize {
        return Err(Error::new(
            ErrorKind::Overflow,
            format!("transfer of {length} bytes exceeds the length field"),
        ));
    }
    let mut merged = ArgList::new();
    merged.push(Arg::new(Type::Ptr, address))?;
    merged.push(Arg::from(length as u32))?;
    for arg in extra {
        merged.push(*arg)?;
    }
    Ok(merged)
}

fn no_device(device: DeviceId) -> Error {
    Error::new(
        ErrorKind::NoDevice,
        format!("{device:?} is not in the registry"),
    )
}

/// Casts a result value down to the declared return type: the value keeps
/// only as many low bytes as the type occupies on the device.
fn cast_return(value: u64, ret: Type, width: Option<Width>) -> Result<u64> {
    let cast = match ret.size(width)? {
        0 => 0,
        8 => value,
        bytes => value & ((1u64 << (bytes * 8)) - 1),
    };
    Ok(cast)
}

/// One request/response round trip: the 64-byte envelope out, the optional
/// bulk payload either way, the 9-byte result frame back. A device-reported
/// error becomes the host error of the same kind.
fn transact(
    device: &mut Device,
    request: &[u8; PACKET_SIZE],
    payload: Payload<'_>,
) -> Result<ResultFrame> {
    let name = device.name().to_owned();
    let endpoint = device.endpoint_mut()?;
    trace!("-> {:02x?}", &request[..]);
    endpoint
        .push(request)
        .map_err(|err| transfer_error(&name, &err))?;
    match payload {
        Payload::None => {}
        Payload::Outbound(bytes) => {
            endpoint
                .push(bytes)
                .map_err(|err| transfer_error(&name, &err))?;
        }
        Payload::Inbound(bytes) => {
            endpoint
                .pull(bytes)
                .map_err(|err| retrieve_error(&name, &err))?;
        }
    }
    let mut frame = [0u8; RESULT_SIZE];
    endpoint
        .pull(&mut frame)
        .map_err(|err| retrieve_error(&name, &err))?;
    let result = ResultFrame::from_bytes(&frame)?;
    trace!(
        "<- value 0x{:x}, error '{}'",
        result.value(),
        result.error_kind()
    );
    let kind = result.error_kind();
    if !kind.is_ok() {
        return Err(Error::new(
            kind,
            format!("an error occurred on the device '{name}'"),
        ));
    }
    Ok(result)
}

fn transfer_error(name: &str, err: &Error) -> Error {
    Error::new(
        ErrorKind::Endpoint,
        format!(
            "failed to transfer packet to device '{name}': {}",
            err.message()
        ),
    )
}

fn retrieve_error(name: &str, err: &Error) -> Error {
    Error::new(
        ErrorKind::Endpoint,
        format!(
            "failed to retrieve packet from device '{name}': {}",
            err.message()
        ),
    )
}
