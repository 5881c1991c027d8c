//! The rule engine: rules, rule sets and the phase-gated scan that turns a
//! connection's state into a decision.

pub mod expr;
pub mod lexer;
pub mod options;
pub mod parser;

use crate::context::Context;
use expr::Expr;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub use parser::{parse_file, parse_str};

/// SMTP conversation phase. `Any` means no phase was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Any,
    Connect,
    Helo,
    Mfrom,
    Rto,
    Data,
    Message,
}

impl Phase {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "@connect" => Some(Phase::Connect),
            "@helo" => Some(Phase::Helo),
            "@from" => Some(Phase::Mfrom),
            "@to" => Some(Phase::Rto),
            "@data" => Some(Phase::Data),
            "@message" => Some(Phase::Message),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Any => "@any",
            Phase::Connect => "@connect",
            Phase::Helo => "@helo",
            Phase::Mfrom => "@from",
            Phase::Rto => "@to",
            Phase::Data => "@data",
            Phase::Message => "@message",
        };
        write!(f, "{name}")
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a matching rule does, weakest to strongest. `NoResult` is
/// `set-with`: it only sets with-options and lets the scan go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Error,
    NoResult,
    Accept,
    Stall,
    Reject,
}

impl Action {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "accept" => Some(Action::Accept),
            "reject" => Some(Action::Reject),
            "stall" => Some(Action::Stall),
            "set-with" => Some(Action::NoResult),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Error => "ERROR",
            Action::NoResult => "set-with",
            Action::Accept => "accept",
            Action::Stall => "stall",
            Action::Reject => "reject",
        };
        write!(f, "{name}")
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where in a rule file something went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("{location}: {message}")]
    Lex { location: Location, message: String },
    #[error("{location}: {message}")]
    Syntax { location: Location, message: String },
    #[error("{location}: {message}")]
    Semantic { location: Location, message: String },
    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
    /// An included file could not be read.
    #[error("{location}: cannot include {source}")]
    Include {
        location: Location,
        #[source]
        source: Box<RuleError>,
    },
}

/// One alternative of a rule, with the options it sets when it matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RClause {
    pub expr: Expr,
    /// `make-yakker` takes no value and is stored with an empty one.
    pub withs: HashMap<String, String>,
}

impl fmt::Display for RClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.withs.is_empty() {
            return Ok(());
        }
        write!(f, " with")?;
        let sorted: BTreeMap<_, _> = self.withs.iter().collect();
        for (name, value) in sorted {
            if name == "make-yakker" {
                write!(f, " {name}")?;
            } else {
                write!(f, " {name} {}", lexer::quote(value))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub clauses: Vec<RClause>,
    pub result: Action,
    /// Earliest phase at which everything the rule looks at is known.
    pub requires: Phase,
    /// Explicit phase the rule is restricted to, `Any` if none. Never
    /// earlier than `requires` unless `Any`.
    pub deferto: Phase,
}

impl Rule {
    /// Check the rule's clauses in order. The first matching clause merges
    /// its with-options into the context and the rule matches.
    ///
    /// If any clause evaluated runs into missing data (an empty or missing
    /// pattern file), the whole rule is a miss, including clauses after it
    /// that would have matched.
    pub async fn check(&self, ctx: &mut Context) -> bool {
        ctx.rulemiss = false;
        for clause in &self.clauses {
            let matched = clause.expr.eval(ctx).await;
            if ctx.rulemiss {
                log::debug!("Rule '{self}' skipped: missing match data");
                return false;
            }
            if !matched {
                continue;
            }
            for (name, value) in &clause.withs {
                ctx.withprops.insert(name.clone(), value.clone());
            }
            return true;
        }
        false
    }

    fn applies_at(&self, phase: Phase) -> bool {
        self.requires <= phase && (self.deferto == Phase::Any || self.deferto == phase)
    }
}

impl fmt::Display for Rule {
    /// Canonical text that parses back to the same rule.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deferto != Phase::Any {
            write!(f, "{} ", self.deferto)?;
        }
        write!(f, "{} ", self.result)?;
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

/// The outcome of a scan: an action plus the with-options in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub withprops: BTreeMap<String, String>,
}

impl Decision {
    fn new(action: Action, ctx: &Context) -> Self {
        Self {
            action,
            withprops: ctx
                .withprops
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.withprops.get(name).map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.get("message")
    }

    pub fn note(&self) -> Option<&str> {
        self.get("note")
    }

    pub fn savedir(&self) -> Option<&str> {
        self.get("savedir")
    }

    pub fn tls_opt(&self) -> Option<&str> {
        self.get("tls-opt")
    }

    pub fn make_yakker(&self) -> bool {
        self.withprops.contains_key("make-yakker")
    }
}

/// All the rules for one connection, in priority order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ruleset {
    pub rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The rule set used when the real rules can't be loaded: stall
    /// everything.
    pub fn stall_all() -> Self {
        Self::new(vec![Rule {
            clauses: vec![RClause {
                expr: Expr::All,
                withs: HashMap::new(),
            }],
            result: Action::Stall,
            requires: Phase::Any,
            deferto: Phase::Any,
        }])
    }

    /// Scan the rules that can fire at `phase`, first match wins.
    ///
    /// Rules without an explicit phase are checked at every phase from the
    /// one they require onwards; rules with one only at that phase. A
    /// matching `set-with` rule sets its options and the scan goes on. With
    /// no deciding rule the answer is accept, carrying whatever options
    /// have been set so far.
    pub async fn decide(&self, phase: Phase, ctx: &mut Context) -> Decision {
        for rule in self.rules.iter().filter(|r| r.applies_at(phase)) {
            if !rule.check(ctx).await {
                continue;
            }
            if rule.result == Action::NoResult {
                log::debug!("{phase}: set-with rule matched: {rule}");
                continue;
            }
            log::info!("{phase}: {} by rule: {rule}", rule.result);
            return Decision::new(rule.result, ctx);
        }
        Decision::new(Action::Accept, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeloVerb;
    use crate::dns::mock::StaticDns;
    use crate::patterns::FilePatterns;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn context() -> Context {
        let mut ctx = Context::new(Arc::new(StaticDns::new()), Arc::new(FilePatterns::new()));
        ctx.remote_ip = "192.0.2.25".parse().ok();
        ctx.local_ip = "192.0.2.1".parse().ok();
        ctx
    }

    fn ruleset(text: &str) -> Ruleset {
        Ruleset::new(parse_str(text, "test.rules").unwrap())
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_phase_and_action_order() {
        assert!(Phase::Any < Phase::Connect);
        assert!(Phase::Rto < Phase::Data);
        assert!(Action::NoResult < Action::Accept);
        assert!(Action::Stall < Action::Reject);
        assert_eq!(Phase::Mfrom.to_string(), "@from");
        assert_eq!(Action::NoResult.to_string(), "set-with");
    }

    #[tokio::test]
    async fn test_from_to_rule_waits_for_rcpt() {
        let rules = ruleset("reject from info@fbi.gov to joe@example.com\n");
        let mut ctx = context();

        ctx.from = "info@fbi.gov".to_string();
        assert_eq!(rules.decide(Phase::Mfrom, &mut ctx).await.action, Action::Accept);

        ctx.rcptto = "joe@example.com".to_string();
        assert_eq!(rules.decide(Phase::Rto, &mut ctx).await.action, Action::Reject);

        ctx.rcptto = "jim@example.com".to_string();
        assert_eq!(rules.decide(Phase::Rto, &mut ctx).await.action, Action::Accept);

        ctx.from = "someone@fbi.gov".to_string();
        ctx.rcptto = "joe@example.com".to_string();
        assert_eq!(rules.decide(Phase::Rto, &mut ctx).await.action, Action::Accept);
    }

    #[tokio::test]
    async fn test_unphased_accept_keeps_matching() {
        let rules = ruleset("accept host .friend.com\nreject all\n");
        let mut ctx = context();
        ctx.rdns.verified = vec!["mail.friend.com.".to_string()];

        for phase in [
            Phase::Connect,
            Phase::Helo,
            Phase::Mfrom,
            Phase::Rto,
            Phase::Data,
            Phase::Message,
        ] {
            assert_eq!(rules.decide(phase, &mut ctx).await.action, Action::Accept);
        }

        let rules = ruleset("@helo accept host .friend.com\nreject all\n");
        assert_eq!(rules.decide(Phase::Helo, &mut ctx).await.action, Action::Accept);
        assert_eq!(rules.decide(Phase::Mfrom, &mut ctx).await.action, Action::Reject);
    }

    #[tokio::test]
    async fn test_compact_set_with_first_clause_wins() {
        let rules = ruleset(
            "set-with from @a.b with message \"Hi\";\n    all with message \"Bye\"\n",
        );
        let mut ctx = context();
        ctx.from = "joe@a.b".to_string();
        let decision = rules.decide(Phase::Mfrom, &mut ctx).await;
        assert_eq!(decision.action, Action::Accept);
        assert_eq!(decision.message(), Some("Hi"));

        let mut ctx = context();
        ctx.from = "joe@c.d".to_string();
        let decision = rules.decide(Phase::Mfrom, &mut ctx).await;
        assert_eq!(decision.message(), Some("Bye"));
    }

    #[tokio::test]
    async fn test_separate_set_with_rules_last_wins() {
        let rules = ruleset(
            "set-with from @a.b with message \"Hi\"\nset-with all with message \"Bye\"\n",
        );
        let mut ctx = context();
        ctx.from = "joe@a.b".to_string();
        let decision = rules.decide(Phase::Mfrom, &mut ctx).await;
        assert_eq!(decision.message(), Some("Bye"));
    }

    #[tokio::test]
    async fn test_set_with_props_carry_into_decision() {
        let rules = ruleset(
            "set-with all with savedir /tmp/saved make-yakker\n\
             reject helo .bad.example with message \"go away\"\n",
        );
        let mut ctx = context();
        ctx.helo_verb = Some(HeloVerb::Ehlo);
        ctx.heloname = "mx.bad.example".to_string();
        let decision = rules.decide(Phase::Helo, &mut ctx).await;
        assert_eq!(decision.action, Action::Reject);
        assert_eq!(
            decision.withprops,
            props(&[
                ("make-yakker", ""),
                ("message", "go away"),
                ("savedir", "/tmp/saved"),
            ])
        );
        assert!(decision.make_yakker());
        assert_eq!(decision.savedir(), Some("/tmp/saved"));
    }

    #[tokio::test]
    async fn test_missing_file_guarded_by_or() {
        let rules = ruleset("accept all or from /no/such/file\n");
        let mut ctx = context();
        ctx.from = "joe@example.com".to_string();
        assert_eq!(rules.decide(Phase::Mfrom, &mut ctx).await.action, Action::Accept);
        assert!(rules.rules[0].check(&mut ctx).await);
        assert!(!ctx.data_unavailable());
    }

    #[tokio::test]
    async fn test_missing_file_abandons_whole_rule() {
        // The second clause would match, but the first one reached a
        // missing file, so the rule as a whole is skipped.
        let rules = ruleset("reject from /no/such/file; all\n");
        let mut ctx = context();
        ctx.from = "joe@example.com".to_string();
        assert!(!rules.rules[0].check(&mut ctx).await);
        assert!(ctx.data_unavailable());
        assert_eq!(rules.decide(Phase::Mfrom, &mut ctx).await.action, Action::Accept);

        // Negation doesn't hide the missing data either.
        let rules = ruleset("reject not from /no/such/file\n");
        assert_eq!(rules.decide(Phase::Mfrom, &mut ctx).await.action, Action::Accept);
    }

    #[tokio::test]
    async fn test_phase_restricted_rule() {
        let rules = ruleset("@message reject all\n");
        let mut ctx = context();
        assert_eq!(rules.decide(Phase::Data, &mut ctx).await.action, Action::Accept);
        assert_eq!(rules.decide(Phase::Message, &mut ctx).await.action, Action::Reject);
    }

    #[tokio::test]
    async fn test_stall_all() {
        let rules = Ruleset::stall_all();
        let mut ctx = context();
        assert_eq!(rules.decide(Phase::Connect, &mut ctx).await.action, Action::Stall);
        assert_eq!(rules.to_string_lines(), vec!["stall all"]);
    }

    #[test]
    fn test_rule_display() {
        let rules = ruleset(
            "@from reject helo-has helo,bareip with note \"bad helo\" message \"no\"\n\
             set-with to @a.example with savedir a; all with make-yakker\n\
             reject all with message \"\"\n",
        );
        assert_eq!(
            rules.to_string_lines(),
            vec![
                "@from reject helo-has bareip,helo with message \"no\" note \"bad helo\"",
                "set-with to @a.example with savedir \"a\"; all with make-yakker",
                "reject all with message \"\"",
            ]
        );
    }

    impl Ruleset {
        fn to_string_lines(&self) -> Vec<String> {
            self.rules.iter().map(|r| r.to_string()).collect()
        }
    }
}
