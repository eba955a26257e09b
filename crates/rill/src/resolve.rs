use std::net::{IpAddr, ToSocketAddrs};

use crate::error::Error;

/// True when `host` is not a literal address and needs the resolver.
pub(crate) fn needs_lookup(host: &str) -> bool {
    host.parse::<IpAddr>().is_err()
}

/// Resolves a name, preferring IPv4 and falling back to IPv6.
///
/// Runs from the reactor's deferred phase, never from inside `connect`.
pub(crate) fn lookup(host: &str) -> Result<IpAddr, Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let addrs: Vec<IpAddr> = match (host, 0u16).to_socket_addrs() {
        Ok(iter) => iter.map(|a| a.ip()).collect(),
        Err(e) => {
            return Err(Error::Resolve { host: host.to_owned(), reason: e.to_string() });
        }
    };
    if let Some(v4) = addrs.iter().find(|a| a.is_ipv4()) {
        return Ok(*v4);
    }
    match addrs.iter().find(|a| a.is_ipv6()) {
        Some(v6) => Ok(*v6),
        None => Err(Error::Resolve { host: host.to_owned(), reason: "no addresses".to_owned() }),
    }
}
