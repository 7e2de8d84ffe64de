//! Host side of the Flipper Message Runtime: invoke functions exported by
//! a remote microcontroller as if they were local.
//!
//! A device exposes named *modules* (groups of indexed functions). The
//! host serializes a call (module, function index, typed argument tuple,
//! declared return type) into a fixed 64-byte packet, ships it over an
//! endpoint (TCP, USB, or caller-supplied), and reads back a fixed result
//! frame carrying a 64-bit value and an error code.
//!
//! ```no_run
//! use fmr_core::{ArgList, Runtime, Type};
//!
//! # fn main() -> fmr_core::Result<()> {
//! let mut runtime = Runtime::new();
//! let device = runtime.attach_network("carbon", "192.168.1.5")?;
//! runtime.configuration(device)?;
//!
//! let led = runtime.module("led")?;
//! runtime.bind(led)?;
//!
//! let mut args = ArgList::new();
//! args.append(10, Type::U8)?;
//! args.append(20, Type::U8)?;
//! args.append(30, Type::U8)?;
//! runtime.invoke(led, 0, Type::Void, &args)?;
//! # Ok(())
//! # }
//! ```
//!
//! The wire format lives in [`packet`]; the transport contract in
//! [`endpoint`]. One request is in flight per device at any time, and the
//! protocol does not multiplex.

pub mod args;
pub mod containers {
    pub mod name;
}
pub mod crc;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod module;
pub mod packet;
pub mod runtime;

pub use args::{Arg, ArgList, Type, MAX_ARGS};
pub use device::{Attributes, Configuration, Device, DeviceId, Width};
pub use endpoint::Endpoint;
pub use error::{Error, ErrorKind, Result};
pub use module::{Module, ModuleId};
pub use packet::{Class, ResultFrame, MAGIC, PACKET_SIZE};
pub use runtime::Runtime;

/// Size of a device or module name on the wire, NUL-padded.
pub const NAME_SIZE: usize = 16;

/// Product name a factory-fresh device announces itself under.
pub const DEFAULT_DEVICE_NAME: &str = "flipper";
