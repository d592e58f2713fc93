use crate::core::config::Credentials;
use crate::core::protocol::{
    AuthMethod, Command, ProtocolError, Reply, SOCKS_VERSION, TargetAddr, USERPASS_SUCCESS,
    USERPASS_VERSION, encode_request, encode_userpass,
};
use async_trait::async_trait;
use std::io;
use strum_macros::IntoStaticStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DialError {
    #[error("connect to upstream {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream accepted none of the offered authentication methods")]
    NoAcceptableMethod,
    #[error("upstream selected unsupported authentication method {0:#04x}")]
    UnsupportedMethod(u8),
    #[error("upstream rejected the credentials (status {0:#04x})")]
    AuthRejected(u8),
    #[error("upstream CONNECT failed: {}", describe_reply(*.0))]
    Rejected(u8),
    #[error("upstream protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("upstream i/o error: {0}")]
    Io(#[from] io::Error),
}

fn describe_reply(code: u8) -> String {
    match Reply::from_repr(code) {
        Some(reply) => reply.to_string(),
        None => format!("unknown reply code {code:#04x}"),
    }
}

impl DialError {
    /// Nearest reply code to send back to the local client.
    pub fn reply(&self) -> Reply {
        match self {
            DialError::Connect { source, .. } => match source.kind() {
                io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
                io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => Reply::HostUnreachable,
                _ => Reply::GeneralFailure,
            },
            DialError::Rejected(code) => match Reply::from_repr(*code) {
                Some(Reply::Succeeded) | None => Reply::GeneralFailure,
                Some(reply) => reply,
            },
            _ => Reply::GeneralFailure,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// An established upstream session: the transport plus the address the upstream bound.
#[derive(Debug)]
pub struct Connected {
    pub stream: TcpStream,
    pub bound: TargetAddr,
}

#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, target: &TargetAddr) -> Result<Connected, DialError>;
}

/// SOCKS5 client for the fixed upstream proxy. Every call opens its own connection.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    upstream_addr: String,
    auth: Option<Credentials>,
}

impl UpstreamDialer {
    pub fn new(upstream_addr: impl Into<String>, auth: Option<Credentials>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            auth,
        }
    }

    async fn connect(&self, target: &TargetAddr) -> Result<Connected, DialError> {
        let mut stream = TcpStream::connect(&self.upstream_addr)
            .await
            .map_err(|source| DialError::Connect {
                addr: self.upstream_addr.clone(),
                source,
            })?;
        let bound = self.handshake(&mut stream, target).await?;
        Ok(Connected { stream, bound })
    }

    /// Greeting, optional RFC 1929 login, then CONNECT. Returns the bound address.
    pub(crate) async fn handshake<S>(
        &self,
        stream: &mut S,
        target: &TargetAddr,
    ) -> Result<TargetAddr, DialError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = match self.auth {
            Some(_) => vec![
                SOCKS_VERSION,
                2,
                AuthMethod::NoAuth as u8,
                AuthMethod::UserPass as u8,
            ],
            None => vec![SOCKS_VERSION, 1, AuthMethod::NoAuth as u8],
        };
        stream.write_all(&greeting).await?;

        let ver = stream.read_u8().await?;
        if ver != SOCKS_VERSION {
            return Err(ProtocolError::Version(ver).into());
        }
        let method = stream.read_u8().await?;
        debug!(method = method, "upstream selected authentication method");
        match (AuthMethod::from_repr(method), &self.auth) {
            (Some(AuthMethod::NoAuth), _) => {}
            (Some(AuthMethod::UserPass), Some(creds)) => authenticate(stream, creds).await?,
            (Some(AuthMethod::NoAcceptable), _) => return Err(DialError::NoAcceptableMethod),
            _ => return Err(DialError::UnsupportedMethod(method)),
        }

        stream
            .write_all(&encode_request(Command::Connect, target)?)
            .await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProtocolError::Version(head[0]).into());
        }
        if head[1] != Reply::Succeeded as u8 {
            return Err(DialError::Rejected(head[1]));
        }
        Ok(TargetAddr::read_from(stream).await?)
    }
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&encode_userpass(&creds.username, &creds.password)?)
        .await?;
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[0] != USERPASS_VERSION {
        return Err(ProtocolError::AuthVersion(status[0]).into());
    }
    if status[1] != USERPASS_SUCCESS {
        return Err(DialError::AuthRejected(status[1]));
    }
    debug!(user = %creds.username, "upstream authentication succeeded");
    Ok(())
}

#[async_trait]
impl Dial for UpstreamDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<Connected, DialError> {
        info!(
            target_addr = %target,
            upstream = %self.upstream_addr,
            "establishing connection through upstream SOCKS5 proxy"
        );
        match self.connect(target).await {
            Ok(connected) => {
                info!(target_addr = %target, bound = %connected.bound, "upstream connection established");
                Ok(connected)
            }
            Err(e) => {
                warn!(target_addr = %target, kind = e.kind(), "upstream dial failed: {}", e);
                Err(e)
            }
        }
    }
}
