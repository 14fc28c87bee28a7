use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use common::{Address, Destination, Network};
use rand::Rng;

use crate::{
    crypto::fnv::fnv,
    error::{Error, Result},
};

pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RequestCommand {
    #[default]
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for RequestCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            other => Err(Error::Unsupported(format!("command {:#04x}", other))),
        }
    }
}

impl From<Network> for RequestCommand {
    fn from(network: Network) -> Self {
        match network {
            Network::Tcp => Self::Tcp,
            Network::Udp => Self::Udp,
        }
    }
}

/// Request option bits.
pub mod option {
    pub const CHUNK_STREAM: u8 = 0x01;
    pub const CONNECTION_REUSE: u8 = 0x02;
    pub const CHUNK_MASKING: u8 = 0x04;
    pub const GLOBAL_PADDING: u8 = 0x08;
    pub const AUTHENTICATED_LENGTH: u8 = 0x10;
}

/// Payload protection for the data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Security {
    /// AES-128-CFB over the whole stream, FNV-1a checked chunks.
    Aes128Cfb = 0x01,
    #[default]
    Aes128Gcm = 0x03,
    /// Keyed with `MD5(key) ‖ MD5(MD5(key))`.
    Chacha20Poly1305 = 0x04,
    None = 0x05,
}

impl Security {
    /// Option bits a client asks for with this security.
    pub fn request_option(self) -> u8 {
        match self {
            Security::Aes128Gcm | Security::Chacha20Poly1305 => {
                option::CHUNK_STREAM | option::CHUNK_MASKING | option::GLOBAL_PADDING
            }
            Security::None => option::CHUNK_STREAM | option::CHUNK_MASKING,
            Security::Aes128Cfb => option::CHUNK_STREAM,
        }
    }
}

impl TryFrom<u8> for Security {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Aes128Cfb),
            0x03 => Ok(Self::Aes128Gcm),
            0x04 => Ok(Self::Chacha20Poly1305),
            0x05 => Ok(Self::None),
            other => Err(Error::Unsupported(format!("security {:#04x}", other))),
        }
    }
}

impl std::str::FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aes-128-cfb" | "legacy" => Ok(Self::Aes128Cfb),
            "aes-128-gcm" | "auto" => Ok(Self::Aes128Gcm),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(Self::Chacha20Poly1305),
            "none" => Ok(Self::None),
            other => Err(Error::Unsupported(format!("security {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    IPv4 = 0x01,
    Domain = 0x02,
    IPv6 = 0x03,
}

/// Decrypted request header sent by the client.
///
/// ```text
/// +-----+----+-----+---+-----+---------+-----+-----+------+------+------+---------+-------+
/// | Ver | IV | Key | V | Opt | P | Sec | Rsv | Cmd | Port | Atyp | Addr | Padding | FNV1a |
/// +-----+----+-----+---+-----+---------+-----+-----+------+------+------+---------+-------+
/// |  1  | 16 |  16 | 1 |  1  |    1    |  1  |  1  |   2  |   1  |  var |    P    |   4   |
/// +-----+----+-----+---+-----+---------+-----+-----+------+------+------+---------+-------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub body_iv: [u8; 16],
    pub body_key: [u8; 16],
    /// Echoed back by the server in the response header.
    pub response_auth: u8,
    pub option: u8,
    pub security: Security,
    pub command: RequestCommand,
    pub address: Address,
}

impl RequestHeader {
    /// A request with fresh random body key, IV and response auth.
    pub fn new(destination: &Destination, security: Security) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            version: VERSION,
            body_iv: rng.gen(),
            body_key: rng.gen(),
            response_auth: rng.gen(),
            option: security.request_option(),
            security,
            command: destination.network.into(),
            address: destination.address.clone(),
        }
    }

    pub fn destination(&self) -> Destination {
        let network = match self.command {
            RequestCommand::Tcp => Network::Tcp,
            RequestCommand::Udp => Network::Udp,
        };
        Destination::new(network, self.address.clone())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let padding_len: u8 = rand::thread_rng().gen_range(0..16);

        let mut v = Vec::with_capacity(64);
        v.push(self.version);
        v.extend_from_slice(&self.body_iv);
        v.extend_from_slice(&self.body_key);
        v.push(self.response_auth);
        v.push(self.option);
        v.push((padding_len << 4) | self.security as u8);
        v.push(0);
        v.push(self.command as u8);
        v.extend_from_slice(&self.address.port().to_be_bytes());
        match &self.address {
            Address::SocketAddr(SocketAddr::V4(addr)) => {
                v.push(AddressType::IPv4 as u8);
                v.extend_from_slice(&addr.ip().octets());
            }
            Address::SocketAddr(SocketAddr::V6(addr)) => {
                v.push(AddressType::IPv6 as u8);
                v.extend_from_slice(&addr.ip().octets());
            }
            Address::DomainName(domain, _) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    Error::InvalidHeader(format!("domain name too long: {}", domain.len()))
                })?;
                v.push(AddressType::Domain as u8);
                v.push(len);
                v.extend_from_slice(domain.as_bytes());
            }
        }

        let mut padding = vec![0u8; padding_len as usize];
        rand::thread_rng().fill(padding.as_mut_slice());
        v.extend_from_slice(&padding);

        let checksum = fnv(&v);
        v.extend_from_slice(&checksum.to_be_bytes());
        Ok(v)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::InvalidHeader(format!("too short: {} bytes", buf.len())));
        }
        let (body, checksum) = buf.split_at(buf.len() - 4);
        if fnv(body).to_be_bytes() != checksum {
            return Err(Error::Checksum);
        }

        let mut cursor = Cursor { buf: body };
        let version = cursor.u8()?;
        if version != VERSION {
            return Err(Error::InvalidHeader(format!("version {}", version)));
        }
        let body_iv = cursor.array::<16>()?;
        let body_key = cursor.array::<16>()?;
        let response_auth = cursor.u8()?;
        let option = cursor.u8()?;
        if option & option::AUTHENTICATED_LENGTH != 0 {
            return Err(Error::Unsupported(format!("request option {:#04x}", option)));
        }
        if option & option::GLOBAL_PADDING != 0 && option & option::CHUNK_MASKING == 0 {
            return Err(Error::InvalidHeader(
                "global padding without chunk masking".to_owned(),
            ));
        }
        let padding_security = cursor.u8()?;
        let padding_len = (padding_security >> 4) as usize;
        let security = Security::try_from(padding_security & 0x0f)?;
        let _reserved = cursor.u8()?;
        let command = RequestCommand::try_from(cursor.u8()?)?;
        let port = u16::from_be_bytes(cursor.array::<2>()?);

        let address = match cursor.u8()? {
            t if t == AddressType::IPv4 as u8 => {
                let ip = Ipv4Addr::from(cursor.array::<4>()?);
                Address::SocketAddr(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            t if t == AddressType::IPv6 as u8 => {
                let ip = Ipv6Addr::from(cursor.array::<16>()?);
                Address::SocketAddr(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
            }
            t if t == AddressType::Domain as u8 => {
                let len = cursor.u8()? as usize;
                let domain = String::from_utf8(cursor.take(len)?.to_vec()).map_err(|e| {
                    Error::InvalidHeader(format!("invalid domain name: {}", e))
                })?;
                Address::DomainName(domain, port)
            }
            other => {
                return Err(Error::InvalidHeader(format!("address type {}", other)));
            }
        };

        if cursor.buf.len() != padding_len {
            return Err(Error::InvalidHeader(format!(
                "expected {} padding bytes, found {}",
                padding_len,
                cursor.buf.len()
            )));
        }

        Ok(RequestHeader {
            version,
            body_iv,
            body_key,
            response_auth,
            option,
            security,
            command,
            address,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::InvalidHeader("truncated".to_owned()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Server reply, sealed separately from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub response_auth: u8,
    pub option: u8,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; 4] {
        // no dynamic command: command 0, length 0
        [self.response_auth, self.option, 0, 0]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::InvalidHeader("short response header".to_owned()));
        }
        Ok(Self {
            response_auth: buf[0],
            option: buf[1],
        })
    }
}
