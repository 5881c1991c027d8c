//! Address, host and IP pattern matching, and the attribute classifiers
//! behind from-has/to-has, helo-has and dns.
//!
//! None of this is a full RFC 5321 parser. It looks for characters in
//! certain positions, which is good enough to sort addresses into the
//! buckets the rules care about.

use crate::context::{Context, HeloVerb, ReverseDns};
use crate::dns::DnsResult;
use crate::rules::options::Opts;
use ipnet::IpNet;
use std::net::IpAddr;

/// Match an address against an address pattern.
///
/// Patterns are `<>` (the null sender), `a@b`, `a@` (local part at any
/// domain, or no domain), `@b` (exactly that domain), `@.b` (b or any
/// subdomain), or `@` (any address with both a local part and a domain).
/// Both sides are lower cased first. Addresses that start or end with `@`
/// never match anything but a literal pattern.
pub fn match_address(addr: &str, pattern: &str) -> bool {
    let addr = addr.to_lowercase();
    let pattern = pattern.to_lowercase();

    if pattern == "<>" {
        return addr.is_empty();
    }
    if addr.starts_with('@') || addr.ends_with('@') {
        return false;
    }
    if pattern == "@" {
        return !addr.is_empty() && addr.contains('@');
    }
    if let Some(local) = pattern.strip_suffix('@') {
        let addr_local = addr.rfind('@').map_or(addr.as_str(), |i| &addr[..i]);
        return addr_local == local;
    }
    if let Some(domain) = pattern.strip_prefix('@') {
        let Some(i) = addr.rfind('@') else {
            return false;
        };
        return match_domain(&addr[i + 1..], domain);
    }
    addr == pattern
}

// `.b` matches b and any subdomain of it; anything else matches exactly.
fn match_domain(domain: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('.') {
        Some(base) => domain == base || domain.ends_with(pattern),
        None => domain == pattern,
    }
}

/// Match a host name against a host pattern, `b` (exactly) or `.b` (b and
/// its subdomains). A trailing root dot on the host is ignored.
pub fn match_host(host: &str, pattern: &str) -> bool {
    let host = host.to_lowercase();
    let pattern = pattern.to_lowercase();
    let host = match host.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => host.as_str(),
    };
    match_domain(host, &pattern)
}

/// Match the domain of a MAIL FROM address against a host pattern.
pub fn match_from_host(addr: &str, host_pattern: &str) -> bool {
    match_address(addr, &format!("@{host_pattern}"))
}

/// Match an IP against an IP address or CIDR block. Patterns that are
/// neither never match.
pub fn match_ip(ip: &str, pattern: &str) -> bool {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    if let Ok(net) = pattern.parse::<IpNet>() {
        return net.contains(&ip);
    }
    pattern
        .parse::<IpAddr>()
        .map_or(false, |p| p.to_canonical() == ip.to_canonical())
}

/// Is `arg` usable as an `ip` pattern.
pub fn is_ip_pattern(arg: &str) -> bool {
    arg.parse::<IpNet>().is_ok() || arg.parse::<IpAddr>().is_ok()
}

/// Syntactic attributes of an address plus the domain part to check in DNS.
fn address_shape(addr: &str) -> (Opts, &str) {
    let mut opts = Opts::empty();
    if addr.is_empty() {
        return (opts, "");
    }
    if !addr.contains('@') {
        return (Opts::NOAT, "");
    }

    // '@route:user@domain'
    let mut rest = addr;
    if addr.starts_with('@') {
        match addr.find(':') {
            Some(colon) if addr[colon + 1..].contains('@') => {
                opts |= Opts::ROUTE;
                rest = &addr[colon + 1..];
            }
            _ => opts |= Opts::GARBAGE,
        }
    }

    let (local, domain) = if rest.starts_with('"') {
        opts |= Opts::QUOTED;
        match closing_quote(rest) {
            Some(end) => {
                let after = &rest[end + 1..];
                match after.strip_prefix('@') {
                    Some(domain) => (&rest[..=end], domain),
                    None => {
                        opts |= Opts::GARBAGE;
                        let at = rest.rfind('@').unwrap_or(rest.len());
                        (&rest[..at], rest.get(at + 1..).unwrap_or(""))
                    }
                }
            }
            None => {
                opts |= Opts::GARBAGE;
                let at = rest.rfind('@').unwrap_or(rest.len());
                (&rest[..at], rest.get(at + 1..).unwrap_or(""))
            }
        }
    } else {
        match rest.rfind('@') {
            Some(at) => (&rest[..at], &rest[at + 1..]),
            None => (rest, ""),
        }
    };

    if addr.contains('<') || addr.contains('>') {
        opts |= Opts::GARBAGE;
    }
    if local.is_empty() || domain.is_empty() || local.contains("..") {
        opts |= Opts::GARBAGE;
    }
    if domain.contains('@') || domain.contains('"') {
        opts |= Opts::GARBAGE;
    }
    if !opts.contains(Opts::QUOTED) && (local.contains('@') || local.contains('"')) {
        opts |= Opts::GARBAGE;
    }
    if !domain.contains('.') {
        opts |= Opts::UNQUALIFIED;
    }
    (opts, domain)
}

// Index of the quote closing the quoted string that starts at s[0].
fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Full attributes of an address. Domain validity (resolves, baddom,
/// unknown) is only worked out for plain addresses, ones that aren't
/// route, unqualified, garbage or noat.
pub async fn address_options(addr: &str, ctx: &mut Context) -> Opts {
    let (mut opts, domain) = address_shape(addr);
    if opts.intersects(Opts::ROUTE | Opts::UNQUALIFIED | Opts::GARBAGE | Opts::NOAT)
        || addr.is_empty()
    {
        return opts;
    }
    opts |= match ctx.domain_validity(domain).await {
        DnsResult::Good => Opts::DOMAIN_VALID,
        DnsResult::Bad => Opts::DOMAIN_INVALID,
        DnsResult::Tempfail => Opts::DOMAIN_TEMPFAIL,
    };
    opts
}

/// The domain of a plain address, if it has one.
pub fn address_domain(addr: &str) -> Option<String> {
    let (opts, domain) = address_shape(addr);
    if addr.is_empty() || opts.intersects(Opts::ROUTE | Opts::UNQUALIFIED | Opts::GARBAGE | Opts::NOAT)
    {
        return None;
    }
    Some(domain.to_lowercase())
}

/// Attributes of a HELO/EHLO name, not counting which verb was used.
pub fn helo_options(name: &str, local: Option<IpAddr>, remote: Option<IpAddr>) -> Opts {
    if name.is_empty() {
        return Opts::NONE | Opts::NODOTS;
    }
    if name == "." {
        return Opts::BOGUS | Opts::NODOTS;
    }

    let which = |ip: IpAddr| {
        let ip = ip.to_canonical();
        if local.map(|l| l.to_canonical()) == Some(ip) {
            Opts::MYIP
        } else if remote.map(|r| r.to_canonical()) == Some(ip) {
            Opts::REMIP
        } else {
            Opts::OTHERIP
        }
    };

    if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        let literal = inner
            .strip_prefix("IPv6:")
            .or_else(|| inner.strip_prefix("ipv6:"))
            .unwrap_or(inner);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Opts::PROPERIP | which(ip);
        }
    }
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Opts::BAREIP | which(ip);
    }
    if !name.contains('.') && !name.contains(':') {
        return Opts::NODOTS;
    }
    Opts::empty()
}

/// HELO attributes for the connection, including the verb bit.
pub fn helo_getter(ctx: &Context) -> Opts {
    let verb = match ctx.helo_verb {
        Some(HeloVerb::Helo) => Opts::HELO,
        Some(HeloVerb::Ehlo) => Opts::EHLO,
        None => Opts::empty(),
    };
    helo_options(&ctx.heloname, ctx.local_ip, ctx.remote_ip) | verb
}

/// Attributes of the remote IP's reverse DNS.
pub fn dns_options(rdns: &ReverseDns) -> Opts {
    let mut opts = if rdns.verified.is_empty() {
        Opts::NODNS
    } else {
        Opts::EXISTS
    };
    if !rdns.nofwd.is_empty() {
        opts |= Opts::NOFWD;
    }
    if !rdns.inconsistent.is_empty() {
        opts |= Opts::INCONSIST;
    }
    if opts == Opts::EXISTS {
        opts |= Opts::GOOD;
    }
    opts
}
