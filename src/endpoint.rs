pub mod network;
#[cfg(feature = "usb")]
pub mod usb;

use crate::error::Result;

/// The capability set the runtime requires from a transport.
///
/// `push` and `pull` move exactly the requested byte count or fail; the
/// runtime never assumes any framing beyond "one request, one response of
/// known size". `destroy` releases OS resources and is idempotent.
///
/// A caller-supplied endpoint is assumed to be connected already; its
/// `configure` is free to ignore the hint.
pub trait Endpoint {
    /// Establishes the connection. The meaning of `hint` is
    /// transport-specific: a device name for USB, a host address for TCP.
    fn configure(&mut self, hint: &str) -> Result<()>;

    /// Writes all of `bytes` to the device.
    fn push(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fills all of `bytes` from the device.
    fn pull(&mut self, bytes: &mut [u8]) -> Result<()>;

    /// Tears the connection down. Safe to call more than once.
    fn destroy(&mut self) -> Result<()>;
}
