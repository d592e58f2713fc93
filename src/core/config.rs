use crate::core::protocol::{HostPortError, split_host_port};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 环境变量前缀，例如 `SOCKS_RELAY_UPSTREAM_ADDR`、`SOCKS_RELAY_LOCAL_AUTH__USERNAME`
pub const ENV_PREFIX: &str = "SOCKS_RELAY";

/// 命令行参数，优先级最高
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Local SOCKS5 server that forwards every connection through one upstream SOCKS5 proxy"
)]
pub(crate) struct Cli {
    /// Listen address for the local SOCKS5 server (e.g. 127.0.0.1:1080)
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<String>,
    /// Upstream SOCKS5 proxy address (e.g. 127.0.0.1:1081)
    #[arg(short = 'r', long = "upstream")]
    pub upstream: Option<String>,
    /// Local SOCKS5 username
    #[arg(long)]
    pub user: Option<String>,
    /// Local SOCKS5 password
    #[arg(long)]
    pub pass: Option<String>,
    /// Upstream SOCKS5 username (optional)
    #[arg(long)]
    pub ruser: Option<String>,
    /// Upstream SOCKS5 password (optional)
    #[arg(long)]
    pub rpass: Option<String>,
    /// Configuration file, ignored when it does not exist
    #[arg(short = 'c', long, default_value = "config.toml")]
    pub config: String,
    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,
    /// Write rolling log files into this directory instead of the console
    #[arg(long)]
    pub log_dir: Option<String>,
    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("listen address (-l) is required")]
    MissingListen,
    #[error("upstream SOCKS5 address (-r) is required")]
    MissingUpstream,
    #[error("invalid {field} address {value:?}: {source}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        #[source]
        source: HostPortError,
    },
    #[error("{0} is longer than 255 bytes")]
    CredentialTooLong(&'static str),
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 配置文件/环境变量结构
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    /// 本地监听地址 host:port
    pub listen_addr: String,
    /// 上游 SOCKS5 地址 host:port
    pub upstream_addr: String,
    /// 本地认证
    pub local_auth: AuthSection,
    /// 上游认证
    pub upstream_auth: AuthSection,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct AuthSection {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct LogConfig {
    pub level: String,
    /// 为空时输出到控制台
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: String::new(),
        }
    }
}

impl AppConfig {
    /// defaults -> 配置文件 -> 环境变量 -> 命令行
    pub(crate) fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let c = Config::builder()
            .add_source(File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut conf: AppConfig = c.try_deserialize()?;
        conf.apply_cli(cli);
        Ok(conf)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        let overrides = [
            (&cli.listen, &mut self.listen_addr),
            (&cli.upstream, &mut self.upstream_addr),
            (&cli.user, &mut self.local_auth.username),
            (&cli.pass, &mut self.local_auth.password),
            (&cli.ruser, &mut self.upstream_auth.username),
            (&cli.rpass, &mut self.upstream_auth.password),
            (&cli.log_level, &mut self.log.level),
            (&cli.log_dir, &mut self.log.dir),
        ];
        for (value, slot) in overrides {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
    }

    pub(crate) fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// 校验并生成运行时配置
    pub(crate) fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ConfigError::MissingListen);
        }
        if self.upstream_addr.is_empty() {
            return Err(ConfigError::MissingUpstream);
        }
        check_host_port("listen", &self.listen_addr)?;
        check_host_port("upstream", &self.upstream_addr)?;

        // 本地认证需要用户名和密码同时存在
        let local_auth = if !self.local_auth.username.is_empty() && !self.local_auth.password.is_empty()
        {
            Some(Credentials::new(&self.local_auth)?)
        } else {
            None
        };
        // 上游认证只要求用户名，密码可以为空
        let upstream_auth = if !self.upstream_auth.username.is_empty() {
            Some(Credentials::new(&self.upstream_auth)?)
        } else {
            None
        };

        Ok(ProxyConfig {
            listen_addr: self.listen_addr.clone(),
            upstream_addr: self.upstream_addr.clone(),
            local_auth,
            upstream_auth,
        })
    }
}

fn check_host_port(field: &'static str, value: &str) -> Result<(), ConfigError> {
    split_host_port(value)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
            source,
        })
}

/// 校验过的运行时配置，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub local_auth: Option<Credentials>,
    pub upstream_auth: Option<Credentials>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn new(section: &AuthSection) -> Result<Self, ConfigError> {
        if section.username.len() > 255 {
            return Err(ConfigError::CredentialTooLong("username"));
        }
        if section.password.len() > 255 {
            return Err(ConfigError::CredentialTooLong("password"));
        }
        Ok(Self {
            username: section.username.clone(),
            password: section.password.clone(),
        })
    }

    /// 逐字节精确比较
    pub(crate) fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn credentials(username: &str, password: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["socks-relay", "--config", "does-not-exist.toml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_build_proxy_config() {
        let conf = AppConfig::load(&cli(&[
            "-l",
            "127.0.0.1:1080",
            "-r",
            "10.0.0.2:1081",
            "--user",
            "alice",
            "--pass",
            "secret",
            "--ruser",
            "bob",
        ]))
        .unwrap();
        let proxy = conf.proxy_config().unwrap();
        assert_eq!(proxy.listen_addr, "127.0.0.1:1080");
        assert_eq!(proxy.upstream_addr, "10.0.0.2:1081");
        assert_eq!(proxy.local_auth, Some(credentials("alice", "secret")));
        // 上游密码为空也启用认证
        assert_eq!(proxy.upstream_auth, Some(credentials("bob", "")));
    }

    #[test]
    fn local_auth_requires_both_fields() {
        let conf = AppConfig::load(&cli(&["-l", "127.0.0.1:1080", "-r", "h:1", "--user", "alice"]))
            .unwrap();
        assert_eq!(conf.proxy_config().unwrap().local_auth, None);
    }

    #[test]
    fn addresses_are_required_and_validated() {
        let only_listen = AppConfig::load(&cli(&["-l", "127.0.0.1:1080"])).unwrap();
        assert!(matches!(
            only_listen.proxy_config(),
            Err(ConfigError::MissingUpstream)
        ));

        let only_upstream = AppConfig::load(&cli(&["-r", "127.0.0.1:1081"])).unwrap();
        assert!(matches!(
            only_upstream.proxy_config(),
            Err(ConfigError::MissingListen)
        ));

        let bad = AppConfig::load(&cli(&["-l", "127.0.0.1:1080", "-r", "upstream-no-port"])).unwrap();
        match bad.proxy_config() {
            Err(ConfigError::InvalidAddress { field, source, .. }) => {
                assert_eq!(field, "upstream");
                assert_eq!(source, HostPortError::MissingPort);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overlong_credentials_are_rejected() {
        let long = "x".repeat(256);
        let conf = AppConfig::load(&cli(&["-l", "127.0.0.1:1", "-r", "h:2", "--ruser", &long])).unwrap();
        assert!(matches!(
            conf.proxy_config(),
            Err(ConfigError::CredentialTooLong("username"))
        ));
    }

    #[test]
    fn file_values_are_overridden_by_flags() {
        let path = std::env::temp_dir().join(format!("socks-relay-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "listen_addr = \"127.0.0.1:2080\"\nupstream_addr = \"10.1.1.1:1081\"\n\n[local_auth]\nusername = \"alice\"\npassword = \"secret\"\n\n[log]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let args = Cli::try_parse_from([
            "socks-relay",
            "--config",
            path.to_str().unwrap(),
            "-r",
            "10.2.2.2:1081",
        ])
        .unwrap();
        let conf = AppConfig::load(&args).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(conf.listen_addr, "127.0.0.1:2080");
        assert_eq!(conf.upstream_addr, "10.2.2.2:1081");
        assert_eq!(conf.log.level, "debug");
        assert_eq!(
            conf.proxy_config().unwrap().local_auth,
            Some(credentials("alice", "secret"))
        );
    }

    #[test]
    fn printed_config_parses_back() {
        let conf = AppConfig::load(&cli(&["-l", "127.0.0.1:1080", "-r", "10.0.0.2:1081"])).unwrap();
        let text = conf.to_toml().unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, conf);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let shown = format!("{:?}", credentials("alice", "secret"));
        assert!(shown.contains("alice"));
        assert!(!shown.contains("secret"));
    }
}
