//! 测试用的进程内上游 SOCKS5 服务，同时充当目标服务器

use crate::core::config::Credentials;
use crate::core::protocol::{TargetAddr, read_userpass};
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

#[derive(Debug, Clone)]
pub(crate) struct FakeUpstream {
    /// 要求客户端认证
    pub credentials: Option<Credentials>,
    /// CONNECT 应答码
    pub reply: u8,
    /// 连接成功后发送给客户端的数据
    pub response: Vec<u8>,
    /// 发送完 response 后直接断开
    pub close_after_response: bool,
}

impl Default for FakeUpstream {
    fn default() -> Self {
        Self {
            credentials: None,
            reply: 0x00,
            response: Vec::new(),
            close_after_response: false,
        }
    }
}

/// 单个连接上观察到的内容
#[derive(Debug, Default)]
pub(crate) struct Observed {
    pub methods: Vec<u8>,
    pub auth: Option<(Vec<u8>, Vec<u8>)>,
    pub target: Option<TargetAddr>,
    pub payload: Vec<u8>,
}

impl FakeUpstream {
    pub(crate) fn bound() -> TargetAddr {
        TargetAddr::from_host_port("10.9.8.7:4321").unwrap()
    }

    /// 接受一个连接
    pub(crate) async fn spawn(self) -> (SocketAddr, mpsc::UnboundedReceiver<Observed>) {
        self.spawn_many(1).await
    }

    /// 接受 `connections` 个连接，每个连接单独一个任务；连接结束时发出观察结果
    pub(crate) async fn spawn_many(
        self,
        connections: usize,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<Observed>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(self);
        tokio::spawn(async move {
            for _ in 0..connections {
                let (mut stream, _) = listener.accept().await.unwrap();
                let fake = fake.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut seen = Observed::default();
                    let _ = fake.serve(&mut stream, &mut seen).await;
                    let _ = tx.send(seen);
                });
            }
        });
        (addr, rx)
    }

    async fn serve(&self, s: &mut TcpStream, seen: &mut Observed) -> io::Result<()> {
        let mut head = [0u8; 2];
        s.read_exact(&mut head).await?;
        let mut methods = vec![0u8; head[1] as usize];
        s.read_exact(&mut methods).await?;
        seen.methods = methods.clone();

        let wanted = if self.credentials.is_some() { 0x02 } else { 0x00 };
        if !methods.contains(&wanted) {
            s.write_all(&[0x05, 0xFF]).await?;
            return Ok(());
        }
        s.write_all(&[0x05, wanted]).await?;

        if let Some(creds) = &self.credentials {
            let (user, pass) = read_userpass(s).await.map_err(io::Error::other)?;
            let ok = creds.matches(&user, &pass);
            seen.auth = Some((user, pass));
            s.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Ok(());
            }
        }

        let mut req = [0u8; 3];
        s.read_exact(&mut req).await?;
        seen.target = Some(TargetAddr::read_from(s).await.map_err(io::Error::other)?);

        let bound = if self.reply == 0x00 {
            Self::bound()
        } else {
            TargetAddr::unspecified()
        };
        let mut reply = BytesMut::from(&[0x05, self.reply, 0x00][..]);
        bound.put(&mut reply).map_err(io::Error::other)?;
        s.write_all(&reply).await?;
        if self.reply != 0x00 {
            return Ok(());
        }

        s.write_all(&self.response).await?;
        if self.close_after_response {
            return Ok(());
        }
        s.read_to_end(&mut seen.payload).await?;
        Ok(())
    }
}

/// 记录每个事件的 message 字段
#[derive(Clone, Default)]
pub(crate) struct MessageLog(Arc<Mutex<Vec<String>>>);

impl MessageLog {
    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .any(|message| message.contains(needle))
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for MessageLog {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));
        self.0.lock().unwrap().push(message);
    }
}
