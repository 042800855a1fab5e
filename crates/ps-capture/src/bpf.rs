//! BPF filter string derivation.
//!
//! When a downstream server is configured, the filter always leads with a
//! clause excluding the stream's own traffic so the sensor never captures
//! what it sends. The port clause that follows depends on the capture mode.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use ps_config::PcapMode;

use crate::CaptureError;

const DNS_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hostname resolution, injectable so filter derivation is testable
/// without the system resolver.
pub trait Resolver: Send + Sync {
    fn lookup_host(
        &self,
        host: &str,
    ) -> impl Future<Output = std::io::Result<Vec<IpAddr>>> + Send;
}

/// Resolver backed by the operating system.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn lookup_host(
        &self,
        host: &str,
    ) -> impl Future<Output = std::io::Result<Vec<IpAddr>>> + Send {
        // Port 0 satisfies the ToSocketAddrs contract; only IPs are kept.
        let host = format!("{}:0", host);
        async move {
            let addrs = tokio::net::lookup_host(host).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        }
    }
}

/// Build the BPF filter for one interface.
///
/// `server` is the downstream receiver (address, port) when one is
/// configured; a hostname address is resolved through `resolver` with a
/// 10 second deadline and every returned IP gets its own exclusion clause.
pub async fn create_bpf_string<R: Resolver>(
    mode: PcapMode,
    server: Option<(&str, u16)>,
    resolver: &R,
    port_list: &[u16],
) -> Result<String, CaptureError> {
    let port_strings: Vec<String> = port_list.iter().map(|p| format!("port {}", p)).collect();
    let ports_joined = port_strings.join(" or ");

    let (address, port) = match server {
        Some(server) => server,
        None => {
            if port_list.is_empty() {
                return Ok(String::new());
            }
            return Ok(match mode {
                PcapMode::Allow => ports_joined,
                PcapMode::Deny => format!("not ( {} )", ports_joined),
                PcapMode::All => String::new(),
            });
        }
    };

    let host_ips: Vec<String> = if address.parse::<IpAddr>().is_ok() {
        vec![address.to_string()]
    } else {
        resolve_host(resolver, address)
            .await?
            .into_iter()
            .map(|ip| ip.to_string())
            .collect()
    };

    let exclusion = host_ips
        .iter()
        .map(|ip| format!("not ( dst host {} and port {} )", ip, port))
        .collect::<Vec<_>>()
        .join(" and ");

    if port_list.is_empty() {
        return Ok(exclusion);
    }

    Ok(match mode {
        PcapMode::Allow => format!("{} and {}", exclusion, ports_joined),
        PcapMode::Deny => format!("{} and ( not ( {} ) )", exclusion, ports_joined),
        PcapMode::All => exclusion,
    })
}

async fn resolve_host<R: Resolver>(resolver: &R, host: &str) -> Result<Vec<IpAddr>, CaptureError> {
    match tokio::time::timeout(DNS_RESOLVE_TIMEOUT, resolver.lookup_host(host)).await {
        Ok(Ok(ips)) => Ok(ips),
        Ok(Err(e)) => Err(CaptureError::Resolve(host.to_string(), e.to_string())),
        Err(_) => Err(CaptureError::Resolve(
            host.to_string(),
            "timed out".to_string(),
        )),
    }
}
