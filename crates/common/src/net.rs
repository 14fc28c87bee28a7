use std::{
    fmt::{Display, Formatter},
    io,
    net::{IpAddr, SocketAddr},
};

use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddr(SocketAddr),
    DomainName(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::SocketAddr(addr) => addr.port(),
            Address::DomainName(_, port) => *port,
        }
    }

    /// Host part without the port, domain names verbatim.
    pub fn host(&self) -> String {
        match self {
            Address::SocketAddr(addr) => addr.ip().to_string(),
            Address::DomainName(domain, _) => domain.clone(),
        }
    }

    /// Builds an address from a host string, keeping IP literals as socket addresses.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => Address::DomainName(host.to_owned(), port),
        }
    }

    /// Opens a TCP connection, resolving domain names first.
    pub async fn connect_tcp(&self) -> io::Result<TcpStream> {
        match self {
            Address::SocketAddr(addr) => TcpStream::connect(addr).await,
            Address::DomainName(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::SocketAddr(addr)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::SocketAddr(addr) => write!(f, "{}", addr),
            Address::DomainName(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Target of one proxied connection, parsed from an inbound handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn new(network: Network, address: Address) -> Self {
        Self { network, address }
    }

    pub fn tcp(address: Address) -> Self {
        Self::new(Network::Tcp, address)
    }

    pub fn udp(address: Address) -> Self {
        Self::new(Network::Udp, address)
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}
