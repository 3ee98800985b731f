use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
};

use log::{debug, info};
use thiserror::Error;

use super::{EndpointInfo, ProtocolTransport, transport::TransportError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid service address '{0}'")]
    InvalidAddress(String),
    #[error("connecting to the service at {endpoint} failed: {source}")]
    Connect { endpoint: String, source: io::Error },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session is closed")]
    Closed,
}

/// One outbound connection exchanging framed messages with a server.
///
/// Every [`send`](Session::send) must be followed by exactly one
/// [`receive`](Session::receive); requests are not pipelined.
pub struct Session {
    transport: Option<ProtocolTransport<TcpStream>>,
    info: EndpointInfo,
}

impl Session {
    pub fn connect(address: &str, port: u16) -> Result<Self, SessionError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| SessionError::InvalidAddress(address.to_string()))?;
        let info = EndpointInfo::new(ip, port);

        let stream = TcpStream::connect(SocketAddr::new(ip, port)).map_err(|source| {
            SessionError::Connect {
                endpoint: info.endpoint().to_string(),
                source,
            }
        })?;
        debug!("session connected to {info}");

        Ok(Self {
            transport: Some(ProtocolTransport::new(stream)),
            info,
        })
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
        transport.write_message(message)?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
        Ok(transport.read_message()?)
    }

    /// [`send`](Session::send) then [`receive`](Session::receive).
    pub fn request(&mut self, message: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.send(message)?;
        self.receive()
    }

    /// Handle that can cut the connection from another thread, unblocking a
    /// pending [`receive`](Session::receive).
    pub fn interrupter(&self) -> Result<SessionInterrupter, SessionError> {
        let transport = self.transport.as_ref().ok_or(SessionError::Closed)?;
        let stream = transport
            .get_ref()
            .try_clone()
            .map_err(|e| SessionError::Transport(TransportError::Read(e)))?;
        Ok(SessionInterrupter { stream })
    }

    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            shutdown(&transport.into_inner());
            info!("session with {} terminated", self.info);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct SessionInterrupter {
    stream: TcpStream,
}

impl SessionInterrupter {
    pub fn interrupt(&self) {
        shutdown(&self.stream);
    }
}

fn shutdown(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotConnected => {}
        Err(e) => debug!("shutdown failed: {e}"),
    }
}
