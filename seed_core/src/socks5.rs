//! SOCKS5 (RFC 1928) wire format: method negotiation, command requests and
//! the UDP relay header.
//!
//! Decoders take the bytes buffered so far and return the parsed value plus
//! the number of bytes consumed, or [`WireError::Truncated`] when more input
//! is needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Port marking a virtual destination whose IP encodes a rendezvous circuit id.
pub const RENDEZVOUS_PORT: u16 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("need more bytes")]
    Truncated,

    #[error("unsupported SOCKS version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown address type {0}")]
    UnknownAddressType(u8),

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
}

/// A SOCKS5 destination or bind address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            Address::Socket(addr) => addr.ip().is_unspecified() && addr.port() == 0,
            Address::Domain(..) => false,
        }
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(..) => None,
        }
    }

    /// The IPv4 part of a rendezvous destination, if this is one.
    pub fn rendezvous_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Address::Socket(SocketAddr::V4(v4)) if v4.port() == RENDEZVOUS_PORT => Some(*v4.ip()),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16(v4.port());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.ip().octets());
                buf.put_u16(v6.port());
            }
            Address::Domain(host, port) => {
                // Names longer than 255 bytes cannot be expressed; truncate.
                let name = &host.as_bytes()[..host.len().min(255)];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name);
                buf.put_u16(*port);
            }
        }
    }

    pub fn decode(mut input: &[u8]) -> Result<(Self, usize), WireError> {
        let start = input.len();
        if input.is_empty() {
            return Err(WireError::Truncated);
        }
        let atyp = input.get_u8();
        let addr = match atyp {
            ATYP_IPV4 => {
                if input.remaining() < 6 {
                    return Err(WireError::Truncated);
                }
                let mut octets = [0u8; 4];
                input.copy_to_slice(&mut octets);
                let port = input.get_u16();
                Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ATYP_IPV6 => {
                if input.remaining() < 18 {
                    return Err(WireError::Truncated);
                }
                let mut octets = [0u8; 16];
                input.copy_to_slice(&mut octets);
                let port = input.get_u16();
                Address::Socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            ATYP_DOMAIN => {
                if input.is_empty() {
                    return Err(WireError::Truncated);
                }
                let len = input.get_u8() as usize;
                if input.remaining() < len + 2 {
                    return Err(WireError::Truncated);
                }
                let host = std::str::from_utf8(&input[..len])
                    .map_err(|_| WireError::InvalidDomain)?
                    .to_string();
                input.advance(len);
                let port = input.get_u16();
                Address::Domain(host, port)
            }
            other => return Err(WireError::UnknownAddressType(other)),
        };
        Ok((addr, start - input.len()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

/// Maps a rendezvous circuit id onto the virtual IPv4 address clients see.
pub fn circuit_id_to_ip(circuit_id: u32) -> Ipv4Addr {
    Ipv4Addr::from(circuit_id)
}

/// Inverse of [`circuit_id_to_ip`].
pub fn ip_to_circuit_id(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// `VER, NMETHODS, METHODS[]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodsRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodsRequest {
    pub fn decode(mut input: &[u8]) -> Result<(Self, usize), WireError> {
        if input.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let version = input.get_u8();
        let count = input.get_u8() as usize;
        if input.remaining() < count {
            return Err(WireError::Truncated);
        }
        let methods = input[..count].to_vec();
        Ok((Self { version, methods }, 2 + count))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_u8(self.version);
        buf.put_u8(self.methods.len() as u8);
        buf.put_slice(&self.methods);
        buf.freeze()
    }
}

/// `VER, METHOD`
pub fn encode_method_response(method: u8) -> Bytes {
    Bytes::copy_from_slice(&[SOCKS_VERSION, method])
}

/// `VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub version: u8,
    pub command: u8,
    pub reserved: u8,
    pub destination: Address,
}

impl CommandRequest {
    pub fn decode(mut input: &[u8]) -> Result<(Self, usize), WireError> {
        if input.remaining() < 3 {
            return Err(WireError::Truncated);
        }
        let version = input.get_u8();
        let command = input.get_u8();
        let reserved = input.get_u8();
        let (destination, used) = Address::decode(input)?;
        Ok((
            Self {
                version,
                command,
                reserved,
                destination,
            },
            3 + used,
        ))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.destination.encoded_len());
        buf.put_u8(self.version);
        buf.put_u8(self.command);
        buf.put_u8(self.reserved);
        self.destination.encode(&mut buf);
        buf.freeze()
    }
}

/// `VER, REP, RSV, ATYP, BND.ADDR, BND.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub reply: u8,
    pub bind: Address,
}

impl CommandResponse {
    pub fn new(reply: u8, bind: Address) -> Self {
        Self { reply, bind }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.bind.encoded_len());
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self.reply);
        buf.put_u8(0);
        self.bind.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<(Self, usize), WireError> {
        if input.remaining() < 3 {
            return Err(WireError::Truncated);
        }
        let version = input.get_u8();
        if version != SOCKS_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let reply = input.get_u8();
        input.advance(1);
        let (bind, used) = Address::decode(input)?;
        Ok((Self { reply, bind }, 3 + used))
    }
}

/// `RSV(2), FRAG, ATYP, DST.ADDR, DST.PORT, DATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub reserved: u16,
    pub frag: u8,
    pub destination: Address,
    pub data: Bytes,
}

impl UdpPacket {
    pub fn new(destination: Address, data: Bytes) -> Self {
        Self {
            reserved: 0,
            frag: 0,
            destination,
            data,
        }
    }

    /// Parses a whole datagram; everything after the header is payload.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let mut input = datagram;
        if input.remaining() < 3 {
            return Err(WireError::Truncated);
        }
        let reserved = input.get_u16();
        let frag = input.get_u8();
        let (destination, used) = Address::decode(input)?;
        let data = Bytes::copy_from_slice(&input[used..]);
        Ok(Self {
            reserved,
            frag,
            destination,
            data,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(3 + self.destination.encoded_len() + self.data.len());
        buf.put_u16(self.reserved);
        buf.put_u8(self.frag);
        self.destination.encode(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}
