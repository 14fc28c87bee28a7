use std::{
    fmt::Display,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    sync::Arc,
};

use common::{
    relay::{copy_bidirectional_with, is_early_close},
    Address, Destination, Dispatcher, Timeouts,
};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    auth::{AuthMethod, HandshakeResponse},
    invalid_data,
    server::Reply,
    AddressType, SocksCommand, Version,
};

pub struct Socks5TcpHandler {
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: Timeouts,
}

impl Socks5TcpHandler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub async fn handle_socks5_client<S, P>(
        &mut self,
        mut stream: S,
        peer_addr: P,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        P: Display,
    {
        // 1. handshake
        let handshake_request = HandshakeRequest::read_from(&mut stream).await?;
        trace!("Handshake request from {}: {:?}", peer_addr, handshake_request);

        // 2. auth
        self.handle_auth(&mut stream, &handshake_request).await?;

        // 3. request
        let header = TcpRequestHeader::from_stream(&mut stream).await?;
        debug!("Request from {}: {}", peer_addr, header);

        match header.command {
            SocksCommand::Connect => self.handle_tcp_connect(stream, header.address).await,
            command => {
                warn!("{:?} from {} is not supported", command, peer_addr);
                reply(&mut stream, Reply::CommandNotSupported).await?;
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{:?} is not supported", command),
                ))
            }
        }
    }

    pub async fn handle_tcp_connect<S>(&mut self, mut stream: S, target: Address) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ray = self.dispatcher.dispatch_to_outbound(Destination::tcp(target));
        reply(&mut stream, Reply::Succeeded).await?;

        let (input, output) = ray.into_parts();
        match copy_bidirectional_with(stream, input, output, self.timeouts).await {
            Ok((up, down)) => {
                debug!("TCP connection closed, {} bytes up, {} bytes down", up, down);
                Ok(())
            }
            Err(e) if is_early_close(&e) => {
                debug!("TCP connection closed early: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn handle_auth<S>(
        &mut self,
        stream: &mut S,
        handshake_request: &HandshakeRequest,
    ) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let method = AuthMethod::select(&handshake_request.methods);
        let handshake_response = HandshakeResponse::new(method);
        trace!("Handshake response: {}", handshake_response);
        stream.write_all(&handshake_response.to_bytes()).await?;

        if method == AuthMethod::NoAcceptable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "no acceptable authentication method",
            ));
        }
        Ok(())
    }
}

/// Sends a reply carrying the unspecified address as the bound address.
async fn reply<S>(stream: &mut S, reply: Reply) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let unspecified = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into();
    let response = TcpResponseHeader::new(reply, unspecified);
    trace!("Response: {}", response);
    stream.write_all(&response.to_bytes()).await
}

/// client handshake request
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    methods: Vec<u8>,
}

impl HandshakeRequest {
    pub async fn read_from<R>(stream: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        let version = Version::try_from(buf[0])?;
        if version != Version::Socks5 {
            return Err(invalid_data(format!("Invalid version: {:?}", version)));
        }
        let mut methods = vec![0u8; buf[1] as usize];
        stream.read_exact(&mut methods).await?;
        Ok(Self { methods })
    }
}

fn address_to_bytes(address: &Address) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match address {
        Address::SocketAddr(SocketAddr::V4(addr)) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Address::SocketAddr(SocketAddr::V6(addr)) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Address::DomainName(domain, _) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| invalid_data(format!("domain name too long: {}", domain.len())))?;
            buf.push(AddressType::DomainName as u8);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    buf.extend_from_slice(&address.port().to_be_bytes());
    Ok(buf)
}

/// tcp request header after auth
#[derive(Debug, Clone)]
pub struct TcpRequestHeader {
    command: SocksCommand,
    address: Address,
}

impl Display for TcpRequestHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.command, self.address)
    }
}

impl TcpRequestHeader {
    /// Reads a request. Unknown commands and address types are answered
    /// with the matching failure reply before the error is returned.
    pub async fn from_stream<S>(stream: &mut S) -> io::Result<TcpRequestHeader>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req_buf = [0u8; 4];
        stream.read_exact(&mut req_buf).await?;

        let version = Version::try_from(req_buf[0])?;
        if version != Version::Socks5 {
            return Err(invalid_data(format!("Invalid version: {:?}", version)));
        }

        let command = match SocksCommand::try_from(req_buf[1]) {
            Ok(command) => command,
            Err(e) => {
                reply(stream, Reply::CommandNotSupported).await?;
                return Err(e);
            }
        };

        let address_type = match AddressType::try_from(req_buf[3]) {
            Ok(address_type) => address_type,
            Err(e) => {
                reply(stream, Reply::AddressTypeNotSupported).await?;
                return Err(e);
            }
        };

        // read address by address type
        let address = match address_type {
            AddressType::Ipv4 => {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await?;

                let port = stream.read_u16().await?;

                Address::SocketAddr(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(buf), port)))
            }
            AddressType::Ipv6 => {
                let mut buf = [0u8; 16];
                stream.read_exact(&mut buf).await?;

                let port = stream.read_u16().await?;
                Address::SocketAddr(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(buf),
                    port,
                    0,
                    0,
                )))
            }
            AddressType::DomainName => {
                let len = stream.read_u8().await? as usize;
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await?;
                let domain = match String::from_utf8(buf) {
                    Ok(domain) => domain,
                    Err(e) => return Err(invalid_data(format!("Invalid domain name: {}", e))),
                };
                let port = stream.read_u16().await?;
                Address::DomainName(domain, port)
            }
        };

        Ok(TcpRequestHeader { command, address })
    }
}

pub struct TcpResponseHeader {
    reply: Reply,
    address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> Self {
        Self { reply, address }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![Version::Socks5 as u8, self.reply as u8, 0x00];
        // the bound address is always an IP literal or a short domain
        buf.extend_from_slice(&address_to_bytes(&self.address).unwrap_or_default());
        buf
    }
}

impl Display for TcpResponseHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.reply, self.address)
    }
}
