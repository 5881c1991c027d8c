//! Match expressions and their evaluation against a connection.

use super::lexer::render_arg;
use super::options::Opts;
use super::Phase;
use crate::classify::{
    address_domain, address_options, dns_options, helo_getter, match_address, match_from_host,
    match_host, match_ip,
};
use crate::context::Context;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

/// Pattern matchers whose argument is a pattern or a pattern file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Helo,
    Host,
    From,
    To,
    Ip,
}

impl MatchKind {
    pub fn keyword(self) -> &'static str {
        match self {
            MatchKind::Helo => "helo",
            MatchKind::Host => "host",
            MatchKind::From => "from",
            MatchKind::To => "to",
            MatchKind::Ip => "ip",
        }
    }

    fn requires(self) -> Phase {
        match self {
            MatchKind::Host | MatchKind::Ip => Phase::Connect,
            MatchKind::Helo => Phase::Helo,
            MatchKind::From => Phase::Mfrom,
            MatchKind::To => Phase::Rto,
        }
    }

    /// The values from the connection the patterns are matched against.
    fn values(self, ctx: &Context) -> Vec<String> {
        match self {
            MatchKind::Helo => vec![ctx.heloname.clone()],
            MatchKind::Host => ctx.rdns.verified.clone(),
            MatchKind::From => vec![ctx.from.clone()],
            MatchKind::To => vec![ctx.rcptto.clone()],
            MatchKind::Ip => vec![ctx.remote_ip.map(|ip| ip.to_string()).unwrap_or_default()],
        }
    }

    fn matcher(self) -> fn(&str, &str) -> bool {
        match self {
            MatchKind::Helo | MatchKind::Host => match_host,
            MatchKind::From | MatchKind::To => match_address,
            MatchKind::Ip => match_ip,
        }
    }
}

/// Attribute tests, each against its own attribute family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasKind {
    Helo,
    From,
    To,
    Dns,
}

impl HasKind {
    pub fn keyword(self) -> &'static str {
        match self {
            HasKind::Helo => "helo-has",
            HasKind::From => "from-has",
            HasKind::To => "to-has",
            HasKind::Dns => "dns",
        }
    }

    fn requires(self) -> Phase {
        match self {
            HasKind::Dns => Phase::Connect,
            HasKind::Helo => Phase::Helo,
            HasKind::From => Phase::Mfrom,
            HasKind::To => Phase::Rto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    All,
    /// `tls on` or `tls off`.
    Tls(bool),
    Dnsbl(String),
    Dbl {
        sources: Opts,
        domain: String,
    },
    Match {
        kind: MatchKind,
        arg: String,
    },
    /// host, helo, or the MAIL FROM domain.
    Source(String),
    Has {
        kind: HasKind,
        opts: Opts,
    },
    And(Vec<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// The earliest phase at which everything this expression looks at
    /// is known.
    pub fn requires(&self) -> Phase {
        match self {
            Expr::All => Phase::Any,
            Expr::Tls(_) | Expr::Source(_) => Phase::Mfrom,
            Expr::Dnsbl(_) => Phase::Connect,
            Expr::Dbl { sources, .. } => {
                let mut phase = Phase::Any;
                if sources.contains(Opts::HOST) {
                    phase = phase.max(Phase::Connect);
                }
                if sources.intersects(Opts::EHLO | Opts::HELO) {
                    phase = phase.max(Phase::Helo);
                }
                if sources.contains(Opts::FROM) {
                    phase = phase.max(Phase::Mfrom);
                }
                phase
            }
            Expr::Match { kind, .. } => kind.requires(),
            Expr::Has { kind, .. } => kind.requires(),
            Expr::And(nodes) => nodes.iter().map(Expr::requires).max().unwrap_or(Phase::Any),
            Expr::Or(left, right) => left.requires().max(right.requires()),
            Expr::Not(node) => node.requires(),
        }
    }

    /// Evaluate against the connection. `and` and `or` short-circuit, so
    /// operands that aren't needed are never evaluated and never signal
    /// missing data.
    pub fn eval<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Expr::All => true,
                Expr::Tls(on) => *on == ctx.tls_on,
                Expr::Dnsbl(domain) => eval_dnsbl(domain, ctx).await,
                Expr::Dbl { sources, domain } => eval_dbl(*sources, domain, ctx).await,
                Expr::Match { kind, arg } => eval_match(*kind, arg, ctx).await,
                Expr::Source(arg) => {
                    eval_match(MatchKind::Host, arg, ctx).await
                        || eval_match(MatchKind::Helo, arg, ctx).await
                        || eval_source_from(arg, ctx).await
                }
                Expr::Has { kind, opts } => {
                    let have = match kind {
                        HasKind::Helo => helo_getter(ctx),
                        HasKind::Dns => dns_options(&ctx.rdns),
                        HasKind::From => {
                            let from = ctx.from.clone();
                            address_options(&from, ctx).await
                        }
                        HasKind::To => {
                            let to = ctx.rcptto.clone();
                            address_options(&to, ctx).await
                        }
                    };
                    have.intersects(*opts)
                }
                Expr::And(nodes) => {
                    for node in nodes {
                        if !node.eval(ctx).await {
                            return false;
                        }
                    }
                    true
                }
                Expr::Or(left, right) => left.eval(ctx).await || right.eval(ctx).await,
                Expr::Not(node) => !node.eval(ctx).await,
            }
        })
    }
}

// An empty pattern list means the data to match against is unavailable,
// which fails the whole rule, not just this matcher.
async fn eval_match(kind: MatchKind, arg: &str, ctx: &mut Context) -> bool {
    let patterns = ctx.pattern_list(arg).await;
    if patterns.is_empty() {
        ctx.rulemiss = true;
        return false;
    }
    let matcher = kind.matcher();
    let values = kind.values(ctx);
    patterns
        .iter()
        .any(|p| values.iter().any(|v| matcher(v, p)))
}

async fn eval_source_from(arg: &str, ctx: &mut Context) -> bool {
    let patterns = ctx.pattern_list(arg).await;
    if patterns.is_empty() {
        ctx.rulemiss = true;
        return false;
    }
    patterns.iter().any(|p| match_from_host(&ctx.from, p))
}

async fn eval_dnsbl(domain: &str, ctx: &mut Context) -> bool {
    // IPv4 only.
    let Some(IpAddr::V4(ip)) = ctx.remote_ip.map(|ip| ip.to_canonical()) else {
        return false;
    };
    let [a, b, c, d] = ip.octets();
    let name = format!("{d}.{c}.{b}.{a}.{domain}");
    let hit = ctx.listed(&name).await;
    if hit {
        ctx.add_dnsbl_hit(domain);
    }
    hit
}

async fn eval_dbl(sources: Opts, domain: &str, ctx: &mut Context) -> bool {
    // A set, so 'dbl any' doesn't probe the same name twice.
    let mut names = BTreeSet::new();
    if sources.intersects(Opts::EHLO | Opts::HELO) && !ctx.heloname.is_empty() {
        names.insert(ctx.heloname.to_lowercase());
    }
    if sources.contains(Opts::HOST) {
        let rdns = &ctx.rdns;
        for name in rdns.verified.iter().chain(&rdns.nofwd).chain(&rdns.inconsistent) {
            let name = name.strip_suffix('.').unwrap_or(name.as_str());
            if !name.is_empty() {
                names.insert(name.to_lowercase());
            }
        }
    }
    if sources.contains(Opts::FROM) && !ctx.from.is_empty() {
        let from = ctx.from.clone();
        let opts = address_options(&from, ctx).await;
        if opts.intersects(Opts::DOMAIN_VALID | Opts::DOMAIN_INVALID | Opts::DOMAIN_TEMPFAIL) {
            if let Some(from_domain) = address_domain(&from) {
                names.insert(from_domain);
            }
        }
    }

    // Every name is probed even after a hit.
    let mut hit = false;
    for name in names {
        if ctx.listed(&format!("{name}.{domain}")).await {
            ctx.add_dnsbl_hit(domain);
            hit = true;
        }
    }
    hit
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::All => write!(f, "all"),
            Expr::Tls(true) => write!(f, "tls on"),
            Expr::Tls(false) => write!(f, "tls off"),
            Expr::Dnsbl(domain) => write!(f, "dnsbl {}", render_arg(domain)),
            Expr::Dbl { sources, domain } => write!(f, "dbl {sources} {}", render_arg(domain)),
            Expr::Match { kind, arg } => write!(f, "{} {}", kind.keyword(), render_arg(arg)),
            Expr::Source(arg) => write!(f, "source {}", render_arg(arg)),
            Expr::Has { kind, opts } => write!(f, "{} {opts}", kind.keyword()),
            Expr::And(nodes) => {
                write!(f, "(")?;
                for node in nodes {
                    write!(f, " {node}")?;
                }
                write!(f, " )")
            }
            Expr::Or(left, right) => write!(f, "( {left} or {right} )"),
            Expr::Not(node) => write!(f, "not {node}"),
        }
    }
}
