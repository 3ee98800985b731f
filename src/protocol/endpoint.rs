use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// Address and port of a server or remote service, fixed once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    address: IpAddr,
    port: u16,
    endpoint: String,
}

impl EndpointInfo {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            endpoint: SocketAddr::new(address, port).to_string(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `address:port` form.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl From<SocketAddr> for EndpointInfo {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip(), value.port())
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}
