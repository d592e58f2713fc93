//! SOCKS5 wire format shared by the listening side and the upstream client (RFC 1928 / RFC 1929).

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use strum_macros::{Display, FromRepr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const SOCKS_VERSION: u8 = 0x05;
pub(crate) const USERPASS_VERSION: u8 = 0x01;
pub(crate) const USERPASS_SUCCESS: u8 = 0x00;
pub(crate) const USERPASS_FAILURE: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub(crate) enum AuthMethod {
    #[strum(to_string = "no-auth")]
    NoAuth = 0x00,
    #[strum(to_string = "username/password")]
    UserPass = 0x02,
    #[strum(to_string = "no acceptable methods")]
    NoAcceptable = 0xFF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub(crate) enum Command {
    #[strum(to_string = "CONNECT")]
    Connect = 0x01,
    #[strum(to_string = "BIND")]
    Bind = 0x02,
    #[strum(to_string = "UDP ASSOCIATE")]
    UdpAssociate = 0x03,
}

/// Reply field of a request response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Reply {
    #[strum(to_string = "succeeded")]
    Succeeded = 0x00,
    #[strum(to_string = "general SOCKS server failure")]
    GeneralFailure = 0x01,
    #[strum(to_string = "connection not allowed by ruleset")]
    NotAllowed = 0x02,
    #[strum(to_string = "network unreachable")]
    NetworkUnreachable = 0x03,
    #[strum(to_string = "host unreachable")]
    HostUnreachable = 0x04,
    #[strum(to_string = "connection refused")]
    ConnectionRefused = 0x05,
    #[strum(to_string = "TTL expired")]
    TtlExpired = 0x06,
    #[strum(to_string = "command not supported")]
    CommandNotSupported = 0x07,
    #[strum(to_string = "address type not supported")]
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),
    #[error("unsupported username/password sub-negotiation version {0:#04x}")]
    AuthVersion(u8),
    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    #[error("{0} is longer than 255 bytes")]
    TooLong(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostPortError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("missing host")]
    EmptyHost,
    #[error("too many colons, IPv6 hosts must be bracketed")]
    TooManyColons,
    #[error("missing ']' in address")]
    MissingBracket,
}

/// Splits `host:port` (or `[v6]:port`) the way dial strings are written.
pub fn split_host_port(s: &str) -> Result<(&str, u16), HostPortError> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or(HostPortError::MissingBracket)?;
        let port = tail.strip_prefix(':').ok_or(HostPortError::MissingPort)?;
        (host, port)
    } else {
        let (host, port) = s.rsplit_once(':').ok_or(HostPortError::MissingPort)?;
        if host.contains(':') {
            return Err(HostPortError::TooManyColons);
        }
        (host, port)
    };
    if host.is_empty() {
        return Err(HostPortError::EmptyHost);
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| HostPortError::InvalidPort(port.to_string()))?;
    Ok((host, port))
}

/// Destination of a request, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn unspecified() -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn from_host_port(s: &str) -> Result<Self, HostPortError> {
        let (host, port) = split_host_port(s)?;
        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        })
    }

    pub(crate) async fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        Self::read_with_type(r, atyp).await
    }

    pub(crate) async fn read_with_type<R>(r: &mut R, atyp: u8) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(TargetAddr::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let port = r.read_u16().await?;
                let name = String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?;
                Ok(TargetAddr::Domain(name, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(TargetAddr::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(ProtocolError::AddressType(other)),
        }
    }

    /// Appends `ATYP | ADDR | PORT`.
    pub(crate) fn put(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(name, port) => {
                let len = u8::try_from(name.len()).map_err(|_| ProtocolError::TooLong("domain"))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`
pub(crate) async fn write_reply<W>(
    w: &mut W,
    reply: Reply,
    bound: &TargetAddr,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(0x00);
    bound.put(&mut buf)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`
pub(crate) fn encode_request(cmd: Command, target: &TargetAddr) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::with_capacity(262);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(cmd as u8);
    buf.put_u8(0x00);
    target.put(&mut buf)?;
    Ok(buf)
}

/// RFC 1929 request: `VER | ULEN | UNAME | PLEN | PASSWD`
pub(crate) fn encode_userpass(username: &str, password: &str) -> Result<BytesMut, ProtocolError> {
    let ulen = u8::try_from(username.len()).map_err(|_| ProtocolError::TooLong("username"))?;
    let plen = u8::try_from(password.len()).map_err(|_| ProtocolError::TooLong("password"))?;
    let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
    buf.put_u8(USERPASS_VERSION);
    buf.put_u8(ulen);
    buf.put_slice(username.as_bytes());
    buf.put_u8(plen);
    buf.put_slice(password.as_bytes());
    Ok(buf)
}

/// Reads an RFC 1929 request and returns the raw username and password bytes.
pub(crate) async fn read_userpass<R>(r: &mut R) -> Result<(Vec<u8>, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let ver = r.read_u8().await?;
    if ver != USERPASS_VERSION {
        return Err(ProtocolError::AuthVersion(ver));
    }
    let ulen = r.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    r.read_exact(&mut username).await?;
    let plen = r.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    r.read_exact(&mut password).await?;
    Ok((username, password))
}
