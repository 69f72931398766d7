//! Target address parsing.
//!
//! The address format decides which probe runs:
//! - `http://…` / `https://…` issue an HTTP GET
//! - `tcp://host:port` or `host:port` open a TCP connection
//! - `icmp://host` or a bare host / IP send one ICMP echo

use std::net::{IpAddr, SocketAddr};
use url::{Host, Url};

use super::checker::ProbeError;

/// Probe flavour selected from a target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Http(Url),
    /// `host:port`, ready for `TcpStream::connect`
    Tcp(String),
    /// Host name or IP literal
    Icmp(String),
}

/// Parse a target address into the probe it needs
pub fn parse_address(address: &str) -> Result<ProbeKind, ProbeError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProbeError::InvalidAddress("address cannot be empty".into()));
    }

    if address.contains("://") {
        return parse_url(address);
    }

    if address.parse::<IpAddr>().is_ok() {
        return Ok(ProbeKind::Icmp(address.to_string()));
    }

    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Ok(ProbeKind::Tcp(socket.to_string()));
    }

    if let Some((host, port)) = address.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| ProbeError::InvalidAddress(format!("invalid port in '{address}'")))?;
        validate_port(port)?;
        validate_hostname(host)?;
        return Ok(ProbeKind::Tcp(format!("{host}:{port}")));
    }

    validate_hostname(address)?;
    Ok(ProbeKind::Icmp(address.to_string()))
}

fn parse_url(address: &str) -> Result<ProbeKind, ProbeError> {
    let url =
        Url::parse(address).map_err(|e| ProbeError::InvalidAddress(format!("invalid URL: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::InvalidAddress(format!("'{address}' has no host")))?
        .to_string();

    match url.scheme() {
        "http" | "https" => Ok(ProbeKind::Http(url)),
        "tcp" => {
            let port = url
                .port()
                .ok_or_else(|| ProbeError::InvalidAddress("TCP target must be tcp://host:port".into()))?;
            validate_port(port)?;
            Ok(ProbeKind::Tcp(format!("{host}:{port}")))
        }
        "icmp" => match url.host() {
            // ping wants the bare address, not the bracketed URL form
            Some(Host::Ipv6(addr)) => Ok(ProbeKind::Icmp(addr.to_string())),
            _ => Ok(ProbeKind::Icmp(host)),
        },
        other => Err(ProbeError::InvalidAddress(format!("unsupported scheme '{other}'"))),
    }
}

fn validate_port(port: u16) -> Result<(), ProbeError> {
    if port == 0 {
        return Err(ProbeError::InvalidAddress("port 0 is not allowed".into()));
    }
    Ok(())
}

/// RFC 1123 host names: dot separated labels of letters, digits and hyphens
fn validate_hostname(host: &str) -> Result<(), ProbeError> {
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(ProbeError::InvalidAddress(format!("invalid host name '{host}'")))
    }
}
