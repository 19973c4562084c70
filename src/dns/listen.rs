//! DNS listen address parsing

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::error::{DnsResult, DnsServiceError};

/// Parse a `host:port` listen address
///
/// Returns `Ok(None)` when the service should stay disabled: an empty
/// string, a missing port, an empty port or port `0`. An empty host binds
/// the unspecified IPv4 address. IPv6 hosts must be bracketed.
///
/// # Errors
///
/// `AddressParse` when the host is not an IP literal, the port is not a
/// number in range, or the brackets/colons are malformed.
///
/// # Example
///
/// ```
/// use tun_intercept::dns::parse_listen;
///
/// assert_eq!(parse_listen("127.0.0.1:53").unwrap(), Some("127.0.0.1:53".parse().unwrap()));
/// assert_eq!(parse_listen(":53").unwrap(), Some("0.0.0.0:53".parse().unwrap()));
/// assert_eq!(parse_listen("127.0.0.1:0").unwrap(), None);
/// assert!(parse_listen("example.com:53").is_err());
/// ```
pub fn parse_listen(listen: &str) -> DnsResult<Option<SocketAddr>> {
    let listen = listen.trim();
    if listen.is_empty() {
        return Ok(None);
    }

    let Some((host, port)) = split_host_port(listen)? else {
        return Ok(None);
    };

    if port.is_empty() || port == "0" {
        return Ok(None);
    }
    let port: u16 = port
        .parse()
        .map_err(|_| DnsServiceError::address_parse(listen, format!("invalid port `{port}`")))?;
    if port == 0 {
        // "00" and friends
        return Ok(None);
    }

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>()
            .map_err(|_| DnsServiceError::address_parse(listen, format!("invalid IP address `{host}`")))?
    };

    Ok(Some(SocketAddr::new(ip, port)))
}

/// Split into host and port; `None` when there is no port at all
fn split_host_port(listen: &str) -> DnsResult<Option<(&str, &str)>> {
    if let Some(rest) = listen.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(DnsServiceError::address_parse(listen, "missing `]`"));
        };
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok(None);
        }
        let Some(port) = tail.strip_prefix(':') else {
            return Err(DnsServiceError::address_parse(listen, "unexpected text after `]`"));
        };
        if host.contains(['[', ']']) || port.contains(['[', ']', ':']) {
            return Err(DnsServiceError::address_parse(listen, "unexpected bracket or colon"));
        }
        return Ok(Some((host, port)));
    }

    if listen.contains(']') {
        return Err(DnsServiceError::address_parse(listen, "unexpected `]`"));
    }
    match listen.matches(':').count() {
        0 => Ok(None),
        1 => Ok(listen.split_once(':')),
        _ => Err(DnsServiceError::address_parse(
            listen,
            "too many colons; bracket IPv6 addresses",
        )),
    }
}
