use crate::core::protocol::TargetAddr;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

/// Outcome of looking at a requested name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The name already is a literal address.
    Literal(IpAddr),
    /// Hand the name to the upstream proxy untouched.
    Deferred(String),
}

pub trait Resolve: Send + Sync {
    fn resolve(&self, name: &str) -> Resolution;
}

/// Never performs a local DNS lookup: hostnames are resolved by the upstream proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteResolver;

impl Resolve for RemoteResolver {
    fn resolve(&self, name: &str) -> Resolution {
        let literal = name
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(name);
        match literal.parse::<IpAddr>() {
            Ok(ip) => Resolution::Literal(ip),
            Err(_) => {
                info!(hostname = name, "using remote DNS resolution for hostname");
                Resolution::Deferred(name.to_string())
            }
        }
    }
}

/// Applies the resolver to a request destination; IP destinations pass through.
pub(crate) fn apply(resolver: &dyn Resolve, target: TargetAddr) -> TargetAddr {
    match target {
        TargetAddr::Domain(name, port) => match resolver.resolve(&name) {
            Resolution::Literal(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Resolution::Deferred(name) => TargetAddr::Domain(name, port),
        },
        ip => ip,
    }
}
