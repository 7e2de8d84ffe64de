use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use log::info;

use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};

/// Port a device listens on when the hint names only a host.
pub const DEFAULT_PORT: u16 = 3258;

/// A TCP endpoint. One request/response round trip per call, so small
/// frames go out immediately (`TCP_NODELAY`).
#[derive(Debug, Default)]
pub struct NetworkEndpoint {
    stream: Option<TcpStream>,
}

impl NetworkEndpoint {
    pub const fn new() -> Self {
        Self { stream: None }
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(Error::new(
                ErrorKind::Endpoint,
                "network endpoint is not connected",
            )),
        }
    }
}

impl Endpoint for NetworkEndpoint {
    fn configure(&mut self, hint: &str) -> Result<()> {
        let address = if hint.contains(':') {
            hint.to_owned()
        } else {
            format!("{hint}:{DEFAULT_PORT}")
        };
        let stream = TcpStream::connect(&address).map_err(|err| {
            Error::new(
                ErrorKind::Endpoint,
                format!("failed to connect to '{address}': {err}"),
            )
        })?;
        let _ = stream.set_nodelay(true);
        info!("connected to {address}");
        self.stream = Some(stream);
        Ok(())
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream()?.write_all(bytes).map_err(|err| {
            Error::new(
                ErrorKind::Endpoint,
                format!("failed to write {} bytes: {err}", bytes.len()),
            )
        })
    }

    fn pull(&mut self, bytes: &mut [u8]) -> Result<()> {
        self.stream()?.read_exact(bytes).map_err(|err| {
            Error::new(
                ErrorKind::Endpoint,
                format!("failed to read {} bytes: {err}", bytes.len()),
            )
        })
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn unconnected_endpoint_fails_with_endpoint_kind() {
        let mut endpoint = NetworkEndpoint::new();
        let err = endpoint.push(&[0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Endpoint);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut endpoint = NetworkEndpoint::new();
        endpoint.destroy().unwrap();
        endpoint.destroy().unwrap();
    }

    #[test]
    fn exact_length_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let echo = thread::spawn(move || -> io::Result<()> {
            let (mut socket, _) = listener.accept()?;
            let mut buf = [0u8; 8];
            socket.read_exact(&mut buf)?;
            socket.write_all(&buf)?;
            Ok(())
        });

        let mut endpoint = NetworkEndpoint::new();
        endpoint.configure(&address.to_string()).unwrap();
        endpoint.push(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut reply = [0u8; 8];
        endpoint.pull(&mut reply).unwrap();
        assert_eq!(reply, [1, 2, 3, 4, 5, 6, 7, 8]);
        endpoint.destroy().unwrap();
        echo.join().unwrap().unwrap();
    }
}
