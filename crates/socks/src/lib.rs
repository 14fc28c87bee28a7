mod auth;
mod server;
mod socks5;

use std::io;

pub use server::{Reply, SocksServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Version {
    Socks4 = 4,
    #[default]
    Socks5 = 5,
}

impl TryFrom<u8> for Version {
    type Error = io::Error;

    fn try_from(version: u8) -> io::Result<Self> {
        match version {
            4 => Ok(Self::Socks4),
            5 => Ok(Self::Socks5),
            _ => Err(invalid_data(format!("invalid version: {}", version))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SocksCommand {
    #[default]
    Connect = 1,
    Bind = 2,
    UdpAssociate = 3,
}

impl TryFrom<u8> for SocksCommand {
    type Error = io::Error;

    fn try_from(command: u8) -> io::Result<Self> {
        match command {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Bind),
            3 => Ok(Self::UdpAssociate),
            _ => Err(invalid_data(format!("invalid command: {}", command))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AddressType {
    #[default]
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = io::Error;

    fn try_from(address_type: u8) -> io::Result<Self> {
        match address_type {
            1 => Ok(Self::Ipv4),
            3 => Ok(Self::DomainName),
            4 => Ok(Self::Ipv6),
            _ => Err(invalid_data(format!("invalid address type: {}", address_type))),
        }
    }
}

pub(crate) fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
