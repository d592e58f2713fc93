use crate::core::config::ProxyConfig;
use crate::core::server::Server;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Owns the listening socket and spawns one task per accepted client.
pub struct Lifecycle {
    listener: TcpListener,
    server: Arc<Server>,
}

impl Lifecycle {
    pub async fn bind(config: &ProxyConfig) -> anyhow::Result<Self> {
        Self::with_server(config, Server::from_config(config)).await
    }

    pub async fn with_server(config: &ProxyConfig, server: Server) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr.as_str())
            .await
            .with_context(|| format!("failed to bind listen address {}", config.listen_addr))?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            server: Arc::new(server),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `shutdown` fires. Sessions get a child token and are not awaited.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut next_id: u64 = 0;
        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopped accepting new connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            next_id += 1;
            let server = self.server.clone();
            let cancel = shutdown.child_token();
            let span = info_span!("session", id = next_id, %peer);
            tokio::spawn(
                async move {
                    info!("accepted connection");
                    match server.serve(socket, &cancel).await {
                        Ok(totals) => debug!(
                            bytes_read = totals.bytes_read,
                            bytes_written = totals.bytes_written,
                            "session finished"
                        ),
                        Err(e) => error!(kind = e.kind(), "Error handling client: {}", e),
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::FakeUpstream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    fn config(listen: &str, upstream: &str) -> ProxyConfig {
        ProxyConfig {
            listen_addr: listen.to_string(),
            upstream_addr: upstream.to_string(),
            local_auth: None,
            upstream_auth: None,
        }
    }

    async fn start(upstream: SocketAddr) -> (SocketAddr, CancellationToken, JoinHandle<anyhow::Result<()>>) {
        let lifecycle = Lifecycle::bind(&config("127.0.0.1:0", &upstream.to_string()))
            .await
            .unwrap();
        let addr = lifecycle.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(lifecycle.run(shutdown.clone()));
        (addr, shutdown, handle)
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = Lifecycle::bind(&config(&addr, "127.0.0.1:1"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to bind listen address"));
    }

    #[tokio::test]
    async fn failed_session_does_not_affect_the_listener() {
        let (upstream, mut observed) = FakeUpstream {
            response: b"pong".to_vec(),
            ..Default::default()
        }
        .spawn()
        .await;
        let (addr, shutdown, handle) = start(upstream).await;

        // 错误的版本号，只影响这个会话
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0x04]).await.unwrap();
        let mut rest = Vec::new();
        bad.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        good.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);
        good.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        good.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        good.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        good.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");
        drop(good);
        assert_eq!(observed.recv().await.unwrap().payload, b"ping");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_other_sessions() {
        let (upstream, mut observed) = FakeUpstream {
            response: b"pong".to_vec(),
            ..Default::default()
        }
        .spawn()
        .await;
        let (addr, shutdown, handle) = start(upstream).await;

        // 只发送版本号后停住，连接保持打开
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&[0x05]).await.unwrap();

        let session = async {
            let mut good = TcpStream::connect(addr).await.unwrap();
            good.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method = [0u8; 2];
            good.read_exact(&mut method).await.unwrap();
            assert_eq!(method, [0x05, 0x00]);
            good.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();
            let mut reply = [0u8; 10];
            good.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], 0x00);

            good.write_all(b"ping").await.unwrap();
            let mut pong = [0u8; 4];
            good.read_exact(&mut pong).await.unwrap();
            assert_eq!(&pong, b"pong");
        };
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap();
        assert_eq!(observed.recv().await.unwrap().payload, b"ping");

        // 停住的会话仍在等待
        let mut buf = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stalled.read(&mut buf))
                .await
                .is_err()
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_accepting() {
        let (upstream, _observed) = FakeUpstream::default().spawn().await;
        let (addr, shutdown, handle) = start(upstream).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
