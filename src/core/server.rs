use crate::core::accounting::{AccountingConn, TrafficSnapshot};
use crate::core::config::{Credentials, ProxyConfig};
use crate::core::protocol::{
    AuthMethod, Command, ProtocolError, Reply, SOCKS_VERSION, TargetAddr, USERPASS_FAILURE,
    USERPASS_SUCCESS, USERPASS_VERSION, read_userpass, write_reply,
};
use crate::core::resolver::{self, RemoteResolver, Resolve};
use crate::core::upstream::{Dial, DialError, UpstreamDialer};
use std::io;
use std::sync::Arc;
use strum_macros::{Display, IntoStaticStr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("relay i/o error: {0}")]
    Relay(#[source] io::Error),
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Protocol(ProtocolError::Io(e))
    }
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionStatus {
    Negotiating,
    Authenticating,
    Relaying,
    Closed,
}

/// 单个连接的状态，归服务它的任务所有
struct ClientSession<S> {
    client: S,
    method: Option<AuthMethod>,
    destination: Option<TargetAddr>,
    status: SessionStatus,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(client: S) -> Self {
        Self {
            client,
            method: None,
            destination: None,
            status: SessionStatus::Negotiating,
        }
    }

    fn transition(&mut self, next: SessionStatus) {
        debug!(from = %self.status, to = %next, "session state");
        self.status = next;
    }

    /// 读取客户端问候并选择认证方式
    async fn negotiate(&mut self, auth_required: bool) -> Result<AuthMethod, SessionError> {
        let ver = self.client.read_u8().await?;
        if ver != SOCKS_VERSION {
            return Err(ProtocolError::Version(ver).into());
        }
        let count = self.client.read_u8().await? as usize;
        let mut offered = vec![0u8; count];
        self.client.read_exact(&mut offered).await?;

        let method = select_method(&offered, auth_required);
        self.client.write_all(&[SOCKS_VERSION, method as u8]).await?;
        debug!(offered = ?offered, selected = %method, "method selection");
        if method == AuthMethod::NoAcceptable {
            return Err(SessionError::NoAcceptableMethod);
        }
        self.method = Some(method);
        Ok(method)
    }

    async fn authenticate(&mut self, expected: &Credentials) -> Result<(), SessionError> {
        self.transition(SessionStatus::Authenticating);
        let (username, password) = read_userpass(&mut self.client).await?;
        let user = String::from_utf8_lossy(&username).into_owned();
        if expected.matches(&username, &password) {
            self.client
                .write_all(&[USERPASS_VERSION, USERPASS_SUCCESS])
                .await?;
            info!(user = %user, "authentication succeeded");
            Ok(())
        } else {
            self.client
                .write_all(&[USERPASS_VERSION, USERPASS_FAILURE])
                .await?;
            warn!(user = %user, "authentication failed");
            Err(SessionError::AuthFailed(user))
        }
    }

    /// 读取请求，只接受 CONNECT
    async fn read_request(&mut self) -> Result<TargetAddr, SessionError> {
        let mut head = [0u8; 3];
        self.client.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProtocolError::Version(head[0]).into());
        }
        let atyp = self.client.read_u8().await?;
        let destination = match TargetAddr::read_with_type(&mut self.client, atyp).await {
            Err(ProtocolError::AddressType(t)) => {
                self.reply_failure(Reply::AddressTypeNotSupported).await;
                return Err(ProtocolError::AddressType(t).into());
            }
            other => other?,
        };
        match Command::from_repr(head[1]) {
            Some(Command::Connect) => {}
            other => {
                debug!(command = ?other, destination = %destination, "rejecting command");
                self.reply_failure(Reply::CommandNotSupported).await;
                return Err(SessionError::UnsupportedCommand(head[1]));
            }
        }
        info!(destination = %destination, "CONNECT request");
        self.destination = Some(destination.clone());
        Ok(destination)
    }

    /// 尽力发送失败应答，随后会关闭连接
    async fn reply_failure(&mut self, reply: Reply) {
        if let Err(e) = write_reply(&mut self.client, reply, &TargetAddr::unspecified()).await {
            debug!("failed to send {} reply: {}", reply, e);
        }
    }
}

/// 配置了本地凭据时选择用户名/密码认证，否则选择无认证
pub(crate) fn select_method(offered: &[u8], auth_required: bool) -> AuthMethod {
    let wanted = if auth_required {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };
    if offered.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    }
}

/// SOCKS5 服务端：握手，经上游拨号，转发
pub struct Server {
    local_auth: Option<Credentials>,
    resolver: Arc<dyn Resolve>,
    dialer: Arc<dyn Dial>,
}

impl Server {
    pub fn new(
        local_auth: Option<Credentials>,
        resolver: Arc<dyn Resolve>,
        dialer: Arc<dyn Dial>,
    ) -> Self {
        Self {
            local_auth,
            resolver,
            dialer,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.local_auth.clone(),
            Arc::new(RemoteResolver),
            Arc::new(UpstreamDialer::new(
                config.upstream_addr.clone(),
                config.upstream_auth.clone(),
            )),
        )
    }

    /// 服务一个客户端直到转发结束，返回上游流量统计
    pub async fn serve<S>(
        &self,
        client: S,
        cancel: &CancellationToken,
    ) -> Result<TrafficSnapshot, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = ClientSession::new(client);
        self.run_session(&mut session, cancel).await
    }

    /// 无论从哪条路径退出，会话最终都进入 Closed
    async fn run_session<S>(
        &self,
        session: &mut ClientSession<S>,
        cancel: &CancellationToken,
    ) -> Result<TrafficSnapshot, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.handle_session(session, cancel).await;
        debug!(
            method = ?session.method,
            destination = ?session.destination,
            "session ended"
        );
        session.transition(SessionStatus::Closed);
        result
    }

    async fn handle_session<S>(
        &self,
        session: &mut ClientSession<S>,
        cancel: &CancellationToken,
    ) -> Result<TrafficSnapshot, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let method = session.negotiate(self.local_auth.is_some()).await?;
        if let (AuthMethod::UserPass, Some(expected)) = (method, &self.local_auth) {
            session.authenticate(expected).await?;
        }

        let destination = session.read_request().await?;
        let target = resolver::apply(self.resolver.as_ref(), destination);

        let connected = match self.dialer.dial(&target).await {
            Ok(connected) => connected,
            Err(e) => {
                session.reply_failure(e.reply()).await;
                return Err(e.into());
            }
        };

        // 先包装上游连接，应答失败时也输出关闭汇总
        let upstream = AccountingConn::new(connected.stream, target.to_string());
        if let Err(e) = write_reply(&mut session.client, Reply::Succeeded, &connected.bound).await {
            upstream.close().await;
            return Err(e.into());
        }

        session.transition(SessionStatus::Relaying);
        relay(&mut session.client, upstream, cancel).await
    }
}

enum Finished {
    Client(io::Result<u64>),
    Upstream(io::Result<u64>),
    Cancelled,
}

/// 双向复制，任一方向结束后关闭两端
async fn relay<C, U>(
    client: C,
    upstream: AccountingConn<U>,
    cancel: &CancellationToken,
) -> Result<TrafficSnapshot, SessionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    let finished = tokio::select! {
        r = tokio::io::copy(&mut client_reader, &mut upstream_writer) => Finished::Client(r),
        r = tokio::io::copy(&mut upstream_reader, &mut client_writer) => Finished::Upstream(r),
        _ = cancel.cancelled() => Finished::Cancelled,
    };

    if let Err(e) = client_writer.shutdown().await {
        debug!("client shutdown after relay: {}", e);
    }
    let totals = upstream_reader.unsplit(upstream_writer).close().await;

    match finished {
        Finished::Client(Ok(n)) => debug!("client closed the connection after {} bytes", n),
        Finished::Upstream(Ok(n)) => debug!("upstream closed the connection after {} bytes", n),
        Finished::Cancelled => debug!("relay cancelled"),
        Finished::Client(Err(e)) | Finished::Upstream(Err(e)) => return Err(SessionError::Relay(e)),
    }
    Ok(totals)
}
