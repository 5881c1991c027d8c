//! DNS capability used by the rule engine, and the mail-domain validity
//! classifier built on top of it.
//!
//! Lookup failures never escape from here as errors. They are folded into
//! the bad/tempfail/good lattice, or into a "not listed" probe result.

use crate::context::ReverseDns;
use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use lazy_static::lazy_static;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// Timeouts, SERVFAIL and anything else that may succeed on retry.
    #[error("temporary DNS failure: {0}")]
    Temporary(String),
    /// NXDOMAIN, no records of the requested type.
    #[error("DNS lookup failed: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    /// Fully qualified target, with its trailing dot.
    pub exchange: String,
}

/// The DNS lookups the engine needs.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn mx_lookup(&self, name: &str) -> Result<Vec<MxRecord>, DnsError>;

    /// Forward A/AAAA lookup.
    async fn ip_lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;

    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;

    /// Is `name` listed, ie does it have any address at all. Used for
    /// DNSBL and DBL probes.
    async fn is_listed(&self, name: &str) -> bool {
        matches!(self.ip_lookup(name).await, Ok(ips) if !ips.is_empty())
    }
}

/// Result of classifying a domain as a mail target. Ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DnsResult {
    Bad,
    Tempfail,
    Good,
}

impl fmt::Display for DnsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsResult::Bad => write!(f, "<dns-bad>"),
            DnsResult::Tempfail => write!(f, "<dns-tempfail>"),
            DnsResult::Good => write!(f, "<dns-good>"),
        }
    }
}

lazy_static! {
    // RFC 1918 space plus IPv6 unique-local and site-local.
    static ref BAD_NETS: Vec<IpNet> = [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "fc00::/7",
        "fec0::/10",
    ]
    .iter()
    .filter_map(|n| n.parse().ok())
    .collect();
}

/// True for routable unicast addresses: not unspecified, loopback,
/// multicast, link-local or the IPv4 broadcast address.
pub fn is_global_unicast(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

fn in_bad_space(ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    BAD_NETS.iter().any(|net| net.contains(&ip))
}

/// Check whether a host is a usable mail delivery target: it must have at
/// least one address and every address must be global unicast outside
/// private space.
pub async fn check_ip(dns: &dyn DnsResolver, host: &str) -> (DnsResult, Option<String>) {
    let addrs = match dns.ip_lookup(host).await {
        Ok(addrs) => addrs,
        Err(e @ DnsError::Temporary(_)) => return (DnsResult::Tempfail, Some(e.to_string())),
        Err(e) => return (DnsResult::Bad, Some(e.to_string())),
    };
    if addrs.is_empty() {
        return (DnsResult::Bad, Some(format!("{host}: no IPs")));
    }
    for ip in addrs {
        if !is_global_unicast(ip) {
            return (
                DnsResult::Bad,
                Some(format!("host {host} IP {ip} not global unicast")),
            );
        }
        if in_bad_space(ip) {
            return (
                DnsResult::Bad,
                Some(format!("host {host} IP {ip} is in bad address space")),
            );
        }
    }
    (DnsResult::Good, None)
}

/// Classify a domain as a mail target via its MX records, falling back to
/// its own addresses when it has none.
///
/// Any MX of `.` or `localhost.` disqualifies the domain regardless of the
/// other MX entries, so every MX is examined. Otherwise the best result
/// across all MX targets wins, together with the reason from the first
/// target that reached it.
pub async fn valid_domain(dns: &dyn DnsResolver, domain: &str) -> (DnsResult, Option<String>) {
    let fqdn = format!("{domain}.");
    let mxs = match dns.mx_lookup(&fqdn).await {
        Ok(mxs) if !mxs.is_empty() => mxs,
        Ok(_) => return check_ip(dns, &fqdn).await,
        Err(DnsError::Temporary(e)) => {
            return (DnsResult::Tempfail, Some(format!("MX tempfail: {e}")));
        }
        Err(e) => {
            log::debug!("MX lookup failed for {domain}: {e}, falling back to A/AAAA lookup");
            return check_ip(dns, &fqdn).await;
        }
    };

    let mut best: Option<(DnsResult, Option<String>)> = None;
    for mx in &mxs {
        if mx.exchange == "." && mx.preference == 0 {
            return (DnsResult::Bad, Some(format!("{domain}: RFC 7505 null MX")));
        }
        let target = mx.exchange.to_lowercase();
        if target == "." || target == "localhost." {
            return (
                DnsResult::Bad,
                Some(format!("rejecting bogus MX {} {}", mx.preference, mx.exchange)),
            );
        }

        let (result, reason) = check_ip(dns, &mx.exchange).await;
        log::debug!("MX {} {} for {domain}: {result}", mx.preference, mx.exchange);
        if best.as_ref().map_or(true, |(b, _)| result > *b) {
            best = Some((result, reason));
        }
    }
    // mxs is non-empty, so best is always set here.
    best.unwrap_or((DnsResult::Tempfail, None))
}

/// Work out the reverse DNS name lists for an IP: PTR names whose forward
/// lookup includes the IP are verified, names that resolve elsewhere are
/// inconsistent, and names that don't resolve at all have no forward.
pub async fn lookup_reverse(dns: &dyn DnsResolver, ip: IpAddr) -> ReverseDns {
    let mut rdns = ReverseDns::default();
    let names = match dns.ptr_lookup(ip).await {
        Ok(names) => names,
        Err(e) => {
            log::debug!("PTR lookup failed for {ip}: {e}");
            return rdns;
        }
    };
    for name in names {
        match dns.ip_lookup(&name).await {
            Ok(addrs) if addrs.iter().any(|a| a.to_canonical() == ip.to_canonical()) => {
                rdns.verified.push(name)
            }
            Ok(addrs) if !addrs.is_empty() => rdns.inconsistent.push(name),
            _ => rdns.nofwd.push(name),
        }
    }
    rdns
}

/// `DnsResolver` backed by hickory's tokio resolver, with a per-lookup
/// timeout.
pub struct HickoryDns {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryDns {
    pub fn from_system_conf(timeout_seconds: u64) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self {
            resolver,
            timeout: Duration::from_secs(timeout_seconds),
        })
    }

    async fn bounded<T, F>(&self, what: &str, lookup: F) -> Result<T, DnsError>
    where
        F: Future<Output = Result<T, ResolveError>>,
    {
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(classify_error(&e)),
            Err(_) => {
                log::debug!("DNS lookup timed out for {what} after {:?}", self.timeout);
                Err(DnsError::Temporary(format!("{what}: lookup timed out")))
            }
        }
    }
}

/// A SERVFAIL answer usually means the authoritative servers couldn't be
/// reached, so it counts as temporary along with timeouts and I/O trouble.
fn classify_error(err: &ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::Timeout
        | ResolveErrorKind::NoConnections
        | ResolveErrorKind::Io(_)
        | ResolveErrorKind::Proto(_) => DnsError::Temporary(err.to_string()),
        ResolveErrorKind::NoRecordsFound { response_code, .. }
            if *response_code == ResponseCode::ServFail =>
        {
            DnsError::Temporary(err.to_string())
        }
        _ => DnsError::Permanent(err.to_string()),
    }
}

fn fully_qualified(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[async_trait]
impl DnsResolver for HickoryDns {
    async fn mx_lookup(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        let found = self.bounded(name, self.resolver.mx_lookup(name)).await?;
        Ok(found
            .iter()
            .map(|mx| MxRecord {
                preference: mx.preference(),
                exchange: mx.exchange().to_string(),
            })
            .collect())
    }

    async fn ip_lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let found = self.bounded(name, self.resolver.lookup_ip(name)).await?;
        Ok(found.iter().collect())
    }

    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let what = ip.to_string();
        let found = self.bounded(&what, self.resolver.reverse_lookup(ip)).await?;
        Ok(found.iter().map(|name| name.to_string()).collect())
    }

    async fn is_listed(&self, name: &str) -> bool {
        let listed = self.ip_lookup(&fully_qualified(name)).await;
        log::debug!("DNS list probe {name}: {listed:?}");
        matches!(listed, Ok(ips) if !ips.is_empty())
    }
}
