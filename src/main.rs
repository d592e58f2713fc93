use crate::core::config::{AppConfig, Cli, ProxyConfig};
use crate::core::lifecycle::{self, Lifecycle};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod core;
mod libs;

fn main() -> anyhow::Result<()> {
    // 本地时区必须在工作线程创建前读取
    let offset = libs::logs::local_offset();
    let cli = Cli::parse();
    let app = AppConfig::load(&cli)?;
    if cli.print_config {
        print!("{}", app.to_toml()?);
        return Ok(());
    }

    libs::logs::init(&app.log, offset)?;
    let config = app
        .proxy_config()
        .inspect_err(|e| error!("invalid configuration: {}", e))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    info!(
        "{} {} starting, forwarding to SOCKS5 proxy {}",
        libs::APP_NAME,
        libs::APP_VERSION,
        config.upstream_addr
    );
    match &config.local_auth {
        Some(creds) => info!("local authentication enabled for user: {}", creds.username),
        None => info!("no local authentication required"),
    }
    match &config.upstream_auth {
        Some(creds) => info!("upstream authentication will be used for user: {}", creds.username),
        None => info!("no upstream authentication provided"),
    }

    let lifecycle = Lifecycle::bind(&config)
        .await
        .inspect_err(|e| error!("{:#}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            lifecycle::shutdown_signal().await;
            info!("received shutdown signal, stopping server...");
            shutdown.cancel();
        }
    });

    lifecycle.run(shutdown).await?;
    info!("server stopped");
    Ok(())
}
