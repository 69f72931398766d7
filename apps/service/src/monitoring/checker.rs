use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use super::validation::{ProbeKind, parse_address};

/// Why a single probe attempt failed
///
/// Transient failures (timeouts, unreachable hosts) are retried by the
/// runner. Everything else ends the probe on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("name resolution failed: {0}")]
    Dns(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The probe itself broke (panic, missing tool, client build failure)
    #[error("probe fault: {0}")]
    Fault(String),
}

impl ProbeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Unreachable(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ProbeError::Fault(_))
    }
}

/// A single reachability check against one address
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Perform one attempt and return the measured round trip
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Dispatches to the HTTP, TCP or ICMP probe based on the address format
pub struct NetworkProbe {
    http: HttpProbe,
    tcp: TcpProbe,
    icmp: IcmpProbe,
}

impl NetworkProbe {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self { http: HttpProbe::new()?, tcp: TcpProbe, icmp: IcmpProbe::default() })
    }
}

#[async_trait::async_trait]
impl Probe for NetworkProbe {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        match parse_address(address)? {
            ProbeKind::Http(url) => self.http.get(url.as_str(), timeout).await,
            ProbeKind::Tcp(addr) => self.tcp.connect(&addr, timeout).await,
            ProbeKind::Icmp(host) => self.icmp.ping(&host, timeout).await,
        }
    }
}

/// HTTP/HTTPS probe
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Fault(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    async fn get(&self, url: &str, limit: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, limit))?;

        let latency = start.elapsed();
        let status = response.status();

        // Consider 2xx and 3xx as success
        if status.is_success() || status.is_redirection() {
            Ok(latency)
        } else {
            Err(ProbeError::Unreachable(format!("HTTP status {}", status.as_u16())))
        }
    }
}

fn classify_reqwest(error: reqwest::Error, limit: Duration) -> ProbeError {
    if error.is_timeout() {
        return ProbeError::Timeout(limit.as_millis() as u64);
    }

    let chain = error_chain(&error);
    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        ProbeError::Dns(chain)
    } else if error.is_builder() {
        ProbeError::InvalidAddress(chain)
    } else {
        ProbeError::Unreachable(chain)
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// TCP connect probe
pub struct TcpProbe;

impl TcpProbe {
    async fn connect(&self, addr: &str, limit: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();

        let attempt = async {
            let mut resolved = tokio::net::lookup_host(addr)
                .await
                .map_err(|e| ProbeError::Dns(format!("{addr}: {e}")))?;
            let socket = resolved
                .next()
                .ok_or_else(|| ProbeError::Dns(format!("{addr}: no addresses")))?;

            tokio::net::TcpStream::connect(socket).await.map_err(|e| classify_io(addr, e))
        };

        timeout(limit, attempt)
            .await
            .map_err(|_| ProbeError::Timeout(limit.as_millis() as u64))??;

        Ok(start.elapsed())
    }
}

fn classify_io(addr: &str, error: io::Error) -> ProbeError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => ProbeError::Permission(format!("{addr}: {error}")),
        _ => ProbeError::Unreachable(format!("{addr}: {error}")),
    }
}

/// ICMP echo through the system `ping` binary
///
/// Raw sockets need elevated privileges, the setuid `ping` tool does not.
pub struct IcmpProbe {
    binary: String,
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self { binary: "ping".to_string() }
    }
}

impl IcmpProbe {
    async fn ping(&self, host: &str, limit: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        let wait_secs = limit.as_secs().max(1).to_string();

        let run = Command::new(&self.binary)
            .args(["-c", "1", "-W", &wait_secs, host])
            .kill_on_drop(true)
            .output();

        let output = timeout(limit, run)
            .await
            .map_err(|_| ProbeError::Timeout(limit.as_millis() as u64))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProbeError::Fault(format!("'{}' not found", self.binary)),
                io::ErrorKind::PermissionDenied => ProbeError::Permission(e.to_string()),
                _ => ProbeError::Fault(format!("failed to run '{}': {e}", self.binary)),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return Ok(parse_ping_time(&stdout).unwrap_or_else(|| start.elapsed()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_ping_failure(host, &stderr))
    }
}

fn classify_ping_failure(host: &str, stderr: &str) -> ProbeError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("unknown host")
        || lowered.contains("name or service not known")
        || lowered.contains("temporary failure in name resolution")
    {
        ProbeError::Dns(host.to_string())
    } else if lowered.contains("operation not permitted") || lowered.contains("permission denied") {
        ProbeError::Permission(stderr.trim().to_string())
    } else {
        ProbeError::Unreachable(format!("{host}: no echo reply"))
    }
}

/// Extract `time=12.3 ms` from ping output
fn parse_ping_time(output: &str) -> Option<Duration> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let millis: f64 = rest[..end].parse().ok()?;
    Some(Duration::from_secs_f64(millis / 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProbeError::Timeout(100).is_transient());
        assert!(ProbeError::Unreachable("x".into()).is_transient());
        assert!(!ProbeError::Dns("x".into()).is_transient());
        assert!(!ProbeError::Permission("x".into()).is_transient());
        assert!(!ProbeError::Fault("x".into()).is_transient());
        assert!(ProbeError::Fault("x".into()).is_fault());
    }

    #[test]
    fn test_parse_ping_time() {
        let output = "64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=12.4 ms\n";
        assert_eq!(parse_ping_time(output).map(|d| d.as_millis()), Some(12));
        assert_eq!(parse_ping_time("no reply"), None);
    }

    #[test]
    fn test_classify_ping_failure() {
        assert!(matches!(
            classify_ping_failure("nohost", "ping: nohost: Name or service not known"),
            ProbeError::Dns(_)
        ));
        assert!(matches!(classify_ping_failure("10.0.0.9", ""), ProbeError::Unreachable(_)));
    }

    #[test]
    fn test_probe_error_serializes_with_kind() {
        let json = serde_json::to_value(ProbeError::Timeout(3000)).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["detail"], 3000);
    }

    #[tokio::test]
    async fn test_tcp_probe_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = NetworkProbe::new().unwrap();
        let latency = probe.probe(&addr, Duration::from_secs(2)).await;
        assert!(latency.is_ok(), "{latency:?}");
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // Bind then drop to get a port that is very likely closed
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let probe = NetworkProbe::new().unwrap();
        let result = probe.probe(&addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Unreachable(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_transient() {
        let probe = NetworkProbe::new().unwrap();
        let result = probe.probe("bad host", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::InvalidAddress(_))));
    }
}
