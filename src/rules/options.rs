use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Attribute bits for helo-has, dns, from-has/to-has and dbl sources.
    ///
    /// All four attribute families share one bitmask. The families never
    /// collide bit-for-bit, but a matcher only ever tests the bits that belong
    /// to its own family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Opts: u64 {
        // EHLO/HELO
        const HELO = 1 << 0;
        const EHLO = 1 << 1;
        const NONE = 1 << 2;
        const BOGUS = 1 << 3;
        const NODOTS = 1 << 4;
        const BAREIP = 1 << 5;
        const PROPERIP = 1 << 6;
        const MYIP = 1 << 7;
        const REMIP = 1 << 8;
        const OTHERIP = 1 << 9;

        // reverse DNS
        const NODNS = 1 << 10;
        const INCONSIST = 1 << 11;
        const NOFWD = 1 << 12;
        const GOOD = 1 << 13;
        const EXISTS = 1 << 14;

        // addresses
        const UNQUALIFIED = 1 << 15;
        const ROUTE = 1 << 16;
        const QUOTED = 1 << 17;
        const NOAT = 1 << 18;
        const GARBAGE = 1 << 19;
        const DOMAIN_VALID = 1 << 20;
        const DOMAIN_INVALID = 1 << 21;
        const DOMAIN_TEMPFAIL = 1 << 22;

        // dbl sources; EHLO doubles as the helo/ehlo source.
        const HOST = 1 << 23;
        const FROM = 1 << 24;

        const BAD = Self::UNQUALIFIED.bits() | Self::ROUTE.bits() | Self::NOAT.bits() | Self::GARBAGE.bits();
        const IP = Self::BAREIP.bits() | Self::PROPERIP.bits();
        const ANY = Self::HOST.bits() | Self::EHLO.bits() | Self::FROM.bits();
    }
}

/// Names accepted by `helo-has`.
pub const HELO_NAMES: &[(&str, Opts)] = &[
    ("none", Opts::NONE),
    ("bogus", Opts::BOGUS),
    ("helo", Opts::HELO),
    ("ehlo", Opts::EHLO),
    ("nodots", Opts::NODOTS),
    ("bareip", Opts::BAREIP),
    ("properip", Opts::PROPERIP),
    ("myip", Opts::MYIP),
    ("remoteip", Opts::REMIP),
    ("otherip", Opts::OTHERIP),
    ("ip", Opts::IP),
];

/// Names accepted by `dns`.
pub const DNS_NAMES: &[(&str, Opts)] = &[
    ("nodns", Opts::NODNS),
    ("noforward", Opts::NOFWD),
    ("inconsistent", Opts::INCONSIST),
    ("exists", Opts::EXISTS),
    ("good", Opts::GOOD),
];

/// Names accepted by `from-has` and `to-has`.
pub const ADDR_NAMES: &[(&str, Opts)] = &[
    ("route", Opts::ROUTE),
    ("noat", Opts::NOAT),
    ("quoted", Opts::QUOTED),
    ("unqualified", Opts::UNQUALIFIED),
    ("garbage", Opts::GARBAGE),
    ("resolves", Opts::DOMAIN_VALID),
    ("baddom", Opts::DOMAIN_INVALID),
    ("unknown", Opts::DOMAIN_TEMPFAIL),
    ("bad", Opts::BAD),
];

/// Sources accepted by `dbl`. `helo` and `ehlo` both select the EHLO name.
pub const DBL_NAMES: &[(&str, Opts)] = &[
    ("host", Opts::HOST),
    ("helo", Opts::EHLO),
    ("ehlo", Opts::EHLO),
    ("from", Opts::FROM),
    ("any", Opts::ANY),
];

// Single-bit names used for rendering. Groups are handled separately.
const BIT_NAMES: &[(Opts, &str)] = &[
    (Opts::HELO, "helo"),
    (Opts::EHLO, "ehlo"),
    (Opts::NONE, "none"),
    (Opts::BOGUS, "bogus"),
    (Opts::NODOTS, "nodots"),
    (Opts::BAREIP, "bareip"),
    (Opts::PROPERIP, "properip"),
    (Opts::MYIP, "myip"),
    (Opts::REMIP, "remoteip"),
    (Opts::OTHERIP, "otherip"),
    (Opts::NODNS, "nodns"),
    (Opts::INCONSIST, "inconsistent"),
    (Opts::NOFWD, "noforward"),
    (Opts::GOOD, "good"),
    (Opts::EXISTS, "exists"),
    (Opts::UNQUALIFIED, "unqualified"),
    (Opts::ROUTE, "route"),
    (Opts::QUOTED, "quoted"),
    (Opts::NOAT, "noat"),
    (Opts::GARBAGE, "garbage"),
    (Opts::DOMAIN_VALID, "resolves"),
    (Opts::DOMAIN_INVALID, "baddom"),
    (Opts::DOMAIN_TEMPFAIL, "unknown"),
    (Opts::HOST, "host"),
    (Opts::FROM, "from"),
];

const GROUP_NAMES: &[(Opts, &str)] = &[(Opts::BAD, "bad"), (Opts::IP, "ip"), (Opts::ANY, "any")];

/// Parse a comma separated attribute list against one name table.
///
/// Returns the offending name on failure.
pub fn parse_list(arg: &str, table: &[(&str, Opts)]) -> Result<Opts, String> {
    let mut opts = Opts::empty();
    for name in arg.split(',') {
        match table.iter().find(|(n, _)| *n == name) {
            Some((_, o)) => opts |= *o,
            None => return Err(name.to_string()),
        }
    }
    Ok(opts)
}

impl fmt::Display for Opts {
    /// Sorted, comma separated names, folding complete groups into their
    /// group name first so the result parses back to the same bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = *self;
        let mut names = Vec::new();
        for (group, name) in GROUP_NAMES {
            if rest.contains(*group) {
                names.push(*name);
                rest.remove(*group);
            }
        }
        for (bit, name) in BIT_NAMES {
            if rest.contains(*bit) {
                names.push(*name);
            }
        }
        names.sort_unstable();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_are_unions() {
        assert_eq!(
            Opts::BAD,
            Opts::UNQUALIFIED | Opts::ROUTE | Opts::NOAT | Opts::GARBAGE
        );
        assert_eq!(Opts::IP, Opts::BAREIP | Opts::PROPERIP);
        assert_eq!(Opts::ANY, Opts::HOST | Opts::EHLO | Opts::FROM);
    }

    #[test]
    fn test_display_folds_groups() {
        assert_eq!((Opts::BAD | Opts::QUOTED).to_string(), "bad,quoted");
        assert_eq!((Opts::BAREIP | Opts::MYIP).to_string(), "bareip,myip");
        assert_eq!(Opts::IP.to_string(), "ip");
        assert_eq!(Opts::ANY.to_string(), "any");
        assert_eq!((Opts::HOST | Opts::FROM).to_string(), "from,host");
        assert_eq!(Opts::empty().to_string(), "");
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list("bad,route", ADDR_NAMES),
            Ok(Opts::BAD | Opts::ROUTE)
        );
        assert_eq!(parse_list("helo", DBL_NAMES), Ok(Opts::EHLO));
        assert_eq!(parse_list("good", DNS_NAMES), Ok(Opts::GOOD));
        assert_eq!(parse_list("good", ADDR_NAMES), Err("good".to_string()));
        assert_eq!(parse_list("", HELO_NAMES), Err(String::new()));
    }

    #[test]
    fn test_display_parses_back() {
        for (_, opts) in ADDR_NAMES {
            let text = opts.to_string();
            assert_eq!(parse_list(&text, ADDR_NAMES), Ok(*opts));
        }
        let mixed = Opts::NONE | Opts::IP | Opts::OTHERIP;
        assert_eq!(parse_list(&mixed.to_string(), HELO_NAMES), Ok(mixed));
    }
}
