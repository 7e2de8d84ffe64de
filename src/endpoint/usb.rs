use std::time::Duration;

use log::{debug, info};
use rusb::{DeviceHandle, GlobalContext};

use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};

const INTERFACE: u8 = 0;
const ENDPOINT_IN: u8 = 0x81;
const ENDPOINT_OUT: u8 = 0x02;
const TIMEOUT: Duration = Duration::from_secs(10);

/// A USB endpoint over a bulk IN/OUT pair.
///
/// Discovery walks the bus and opens the first device whose product string
/// matches the configured name.
#[derive(Default)]
pub struct UsbEndpoint {
    handle: Option<DeviceHandle<GlobalContext>>,
}

impl UsbEndpoint {
    pub const fn new() -> Self {
        Self { handle: None }
    }

    fn handle(&mut self) -> Result<&mut DeviceHandle<GlobalContext>> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(Error::new(
                ErrorKind::Endpoint,
                "usb endpoint is not configured",
            )),
        }
    }

    fn discover(name: &str) -> Result<DeviceHandle<GlobalContext>> {
        let devices = rusb::devices().map_err(usb_error)?;
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(err) => {
                    debug!(
                        "skipping {:03}:{:03}: {err}",
                        device.bus_number(),
                        device.address()
                    );
                    continue;
                }
            };
            match handle.read_product_string_ascii(&descriptor) {
                Ok(product) if product == name => return Ok(handle),
                _ => continue,
            }
        }
        Err(Error::new(
            ErrorKind::Endpoint,
            format!("no usb device named '{name}'"),
        ))
    }
}

impl Endpoint for UsbEndpoint {
    fn configure(&mut self, hint: &str) -> Result<()> {
        let mut handle = Self::discover(hint)?;
        handle.claim_interface(INTERFACE).map_err(usb_error)?;
        info!("opened usb device '{hint}'");
        self.handle = Some(handle);
        Ok(())
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let mut written = 0;
        while written < bytes.len() {
            let n = handle
                .write_bulk(ENDPOINT_OUT, &bytes[written..], TIMEOUT)
                .map_err(usb_error)?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Endpoint, "short bulk write"));
            }
            written += n;
        }
        Ok(())
    }

    fn pull(&mut self, bytes: &mut [u8]) -> Result<()> {
        let handle = self.handle()?;
        let mut filled = 0;
        while filled < bytes.len() {
            let n = handle
                .read_bulk(ENDPOINT_IN, &mut bytes[filled..], TIMEOUT)
                .map_err(usb_error)?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Endpoint, "short bulk read"));
            }
            filled += n;
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.release_interface(INTERFACE);
        }
        Ok(())
    }
}

fn usb_error(err: rusb::Error) -> Error {
    Error::new(ErrorKind::Endpoint, format!("usb: {err}"))
}
