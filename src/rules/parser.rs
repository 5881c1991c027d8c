//! Rule file parser.
//!
//! ```text
//! rule    := [PHASE] ACTION clause (';' clause)*
//! clause  := andl ['with' option+]
//! andl    := orl+
//! orl     := term ('or' (term | ARG))*
//! term    := 'not' term | '(' andl ')' | OPERATOR [ARG...]
//! ```
//!
//! A bare ARG after `or` repeats the operator just before the `or`, so
//! `to a@b or c@d` is `to a@b or to c@d`.

use super::expr::{Expr, HasKind, MatchKind};
use super::lexer::{tokenize, Lexed, Token};
use super::options::{parse_list, Opts, ADDR_NAMES, DBL_NAMES, DNS_NAMES, HELO_NAMES};
use super::{Action, Location, Phase, RClause, Rule, RuleError};
use crate::classify::is_ip_pattern;
use crate::patterns::is_file_ref;
use std::collections::HashMap;

const OPERATORS: &[&str] = &[
    "all", "from", "to", "helo", "ehlo", "host", "source", "ip", "dnsbl", "dbl", "tls",
    "from-has", "to-has", "helo-has", "dns",
];

/// Options allowed after `with`. `make-yakker` takes no value.
pub const WITH_OPTIONS: &[&str] = &["message", "note", "savedir", "tls-opt", "make-yakker"];

/// Parse rules from a file, expanding includes.
pub fn parse_file(path: &str) -> Result<Vec<Rule>, RuleError> {
    let mut stack = vec![path.to_string()];
    parse_path(path, &mut stack)
}

/// Parse rules from text; `name` is used in error messages and as the
/// starting point for include cycle detection.
pub fn parse_str(text: &str, name: &str) -> Result<Vec<Rule>, RuleError> {
    let mut stack = vec![name.to_string()];
    parse_text(text, name, &mut stack)
}

fn parse_path(path: &str, stack: &mut Vec<String>) -> Result<Vec<Rule>, RuleError> {
    let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
        file: path.to_string(),
        source,
    })?;
    parse_text(&text, path, stack)
}

fn parse_text(text: &str, name: &str, stack: &mut Vec<String>) -> Result<Vec<Rule>, RuleError> {
    let tokens = tokenize(text, name)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file: name,
        stack,
    };
    parser.rules()
}

struct Parser<'a> {
    tokens: Vec<Lexed>,
    pos: usize,
    file: &'a str,
    stack: &'a mut Vec<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map_or(&Token::Eof, |lexed| &lexed.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |lexed| lexed.line)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn peek_word(&self) -> Option<&str> {
        match self.peek() {
            Token::Word(w) => Some(w.as_str()),
            _ => None,
        }
    }

    fn location(&self, line: usize) -> Location {
        Location {
            file: self.file.to_string(),
            line,
        }
    }

    fn syntax(&self, message: impl Into<String>) -> RuleError {
        RuleError::Syntax {
            location: self.location(self.line()),
            message: message.into(),
        }
    }

    fn semantic(&self, line: usize, message: impl Into<String>) -> RuleError {
        RuleError::Semantic {
            location: self.location(line),
            message: message.into(),
        }
    }

    fn skip_eols(&mut self) {
        while *self.peek() == Token::Eol {
            self.advance();
        }
    }

    fn end_of_line(&mut self, what: &str) -> Result<(), RuleError> {
        match self.peek() {
            Token::Eol => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            other => Err(self.syntax(format!("unexpected {} after {what}", describe(other)))),
        }
    }

    fn rules(&mut self) -> Result<Vec<Rule>, RuleError> {
        let mut rules = Vec::new();
        loop {
            self.skip_eols();
            match self.peek().clone() {
                Token::Eof => return Ok(rules),
                Token::Word(w) if w == "include" => rules.extend(self.include()?),
                _ => rules.push(self.rule()?),
            }
        }
    }

    fn include(&mut self) -> Result<Vec<Rule>, RuleError> {
        let line = self.line();
        self.advance();
        let path = match self.advance() {
            Token::Word(p) | Token::Quoted(p) => p,
            _ => return Err(self.syntax("include needs a filename")),
        };
        self.end_of_line("include filename")?;
        if self.stack.contains(&path) {
            return Err(self.semantic(line, format!("include loop: {path} includes itself")));
        }
        self.stack.push(path.clone());
        let rules = parse_path(&path, self.stack);
        self.stack.pop();
        rules.map_err(|e| match e {
            RuleError::Io { .. } => RuleError::Include {
                location: self.location(line),
                source: Box::new(e),
            },
            other => other,
        })
    }

    fn rule(&mut self) -> Result<Rule, RuleError> {
        let line = self.line();
        let mut deferto = Phase::Any;
        if let Some(word) = self.peek_word().filter(|w| w.starts_with('@')) {
            deferto = Phase::from_keyword(word)
                .ok_or_else(|| self.syntax(format!("unknown phase '{word}'")))?;
            self.advance();
        }
        let result = match self.peek() {
            Token::Word(w) => Action::from_keyword(w)
                .ok_or_else(|| self.syntax(format!("expected an action, got '{w}'")))?,
            other => return Err(self.syntax(format!("expected an action, got {}", describe(other)))),
        };
        self.advance();

        let mut clauses = vec![self.clause()?];
        // A clause may continue on the line right after the ';', no later.
        while *self.peek() == Token::Semicolon {
            self.advance();
            if *self.peek() == Token::Eol {
                self.advance();
            }
            if matches!(self.peek(), Token::Eol | Token::Eof) {
                return Err(self.syntax("rule ends with ';'"));
            }
            clauses.push(self.clause()?);
        }
        self.end_of_line("rule")?;

        let requires = clauses
            .iter()
            .map(|c| c.expr.requires())
            .max()
            .unwrap_or(Phase::Any);
        if deferto != Phase::Any && deferto < requires {
            return Err(self.semantic(
                line,
                format!("rule needs {requires} data but is restricted to {deferto}"),
            ));
        }
        if result == Action::NoResult && clauses.iter().all(|c| c.withs.is_empty()) {
            return Err(self.semantic(line, "set-with rule without any 'with' options"));
        }
        Ok(Rule {
            clauses,
            result,
            requires,
            deferto,
        })
    }

    fn clause(&mut self) -> Result<RClause, RuleError> {
        let expr = self.andl(false)?;
        let mut withs = HashMap::new();
        if self.peek_word() == Some("with") {
            self.advance();
            withs = self.withs()?;
        }
        Ok(RClause { expr, withs })
    }

    fn withs(&mut self) -> Result<HashMap<String, String>, RuleError> {
        let mut withs = HashMap::new();
        loop {
            let name = match self.peek() {
                Token::Eol | Token::Eof | Token::Semicolon => break,
                Token::Word(w) if WITH_OPTIONS.contains(&w.as_str()) => w.clone(),
                other => {
                    return Err(self.syntax(format!("unknown with option {}", describe(other))))
                }
            };
            self.advance();
            let value = if name == "make-yakker" {
                String::new()
            } else {
                self.argument(&name)?
            };
            match name.as_str() {
                "tls-opt" if value != "off" && value != "no-client" => {
                    return Err(self.syntax(format!("tls-opt must be off or no-client, not '{value}'")));
                }
                "note" if value.contains('\n') => {
                    return Err(self.syntax("note cannot contain a newline"));
                }
                _ => {}
            }
            withs.insert(name, value);
        }
        if withs.is_empty() {
            return Err(self.syntax("'with' without any options"));
        }
        Ok(withs)
    }

    fn andl(&mut self, nested: bool) -> Result<Expr, RuleError> {
        let mut nodes = Vec::new();
        loop {
            match self.peek().clone() {
                Token::RParen if nested => break,
                Token::RParen => return Err(self.syntax("unbalanced parentheses")),
                Token::Eol | Token::Eof | Token::Semicolon if nested => {
                    return Err(self.syntax("unbalanced parentheses"));
                }
                Token::Eol | Token::Eof | Token::Semicolon => break,
                Token::Word(w) if w == "with" => {
                    if nested {
                        return Err(self.syntax("'with' inside parentheses"));
                    }
                    break;
                }
                _ => nodes.push(self.orl()?),
            }
        }
        match nodes.len() {
            0 => Err(self.syntax("missing match operators")),
            1 => Ok(nodes.remove(0)),
            _ => Ok(Expr::And(nodes)),
        }
    }

    fn orl(&mut self) -> Result<Expr, RuleError> {
        let mut left = self.term()?;
        while self.peek_word() == Some("or") {
            self.advance();
            let starts_term = match self.peek() {
                Token::LParen => true,
                Token::Word(w) => w == "not" || OPERATORS.contains(&w.as_str()),
                _ => false,
            };
            let right = if starts_term {
                self.term()?
            } else {
                self.shorthand(&left)?
            };
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // `or ARG` after a single-argument operator.
    fn shorthand(&mut self, left: &Expr) -> Result<Expr, RuleError> {
        let mut last = left;
        while let Expr::Or(_, right) = last {
            last = right;
        }
        let keyword = match last {
            Expr::Match { kind, .. } => kind.keyword(),
            Expr::Has { kind, .. } => kind.keyword(),
            Expr::Source(_) => "source",
            Expr::Dnsbl(_) => "dnsbl",
            _ => {
                let found = describe(self.peek());
                return Err(self.syntax(format!("'or' followed by {found}, not a match operator")));
            }
        };
        self.operator(keyword)
    }

    fn term(&mut self) -> Result<Expr, RuleError> {
        match self.advance() {
            Token::Word(w) if w == "not" => Ok(Expr::Not(Box::new(self.term()?))),
            Token::LParen => {
                let expr = self.andl(true)?;
                match self.advance() {
                    Token::RParen => Ok(expr),
                    _ => Err(self.syntax("unbalanced parentheses")),
                }
            }
            Token::Word(w) => self.operator(&w),
            Token::Quoted(q) => Err(self.syntax(format!(
                "quoted string \"{q}\" cannot be a match operator"
            ))),
            Token::RParen => Err(self.syntax("unbalanced parentheses")),
            other => Err(self.syntax(format!("expected a match operator, got {}", describe(&other)))),
        }
    }

    fn argument(&mut self, what: &str) -> Result<String, RuleError> {
        match self.peek().clone() {
            Token::Word(arg) | Token::Quoted(arg) => {
                self.advance();
                Ok(arg)
            }
            other => Err(self.syntax(format!("{what} needs an argument, got {}", describe(&other)))),
        }
    }

    fn attributes(&mut self, what: &str, table: &[(&str, Opts)]) -> Result<Opts, RuleError> {
        let arg = self.argument(what)?;
        parse_list(&arg, table).map_err(|bad| self.syntax(format!("{what}: unknown option '{bad}'")))
    }

    /// Parse the argument(s) for a match operator whose keyword has just
    /// been consumed.
    fn operator(&mut self, word: &str) -> Result<Expr, RuleError> {
        let matcher = |kind, arg| Expr::Match { kind, arg };
        let expr = match word {
            "all" => Expr::All,
            "tls" => match self.argument(word)?.as_str() {
                "on" => Expr::Tls(true),
                "off" => Expr::Tls(false),
                other => return Err(self.syntax(format!("tls must be on or off, not '{other}'"))),
            },
            "dnsbl" => Expr::Dnsbl(self.argument(word)?),
            "dbl" => {
                let sources = self.attributes(word, DBL_NAMES)?;
                let domain = self.argument(word)?;
                Expr::Dbl { sources, domain }
            }
            "from" => matcher(MatchKind::From, self.argument(word)?),
            "to" => matcher(MatchKind::To, self.argument(word)?),
            "helo" | "ehlo" => matcher(MatchKind::Helo, self.argument(word)?),
            "host" => matcher(MatchKind::Host, self.argument(word)?),
            "ip" => {
                let arg = self.argument(word)?;
                if !is_file_ref(&arg) && !is_ip_pattern(&arg) {
                    return Err(self.syntax(format!("ip: '{arg}' is not an IP address, CIDR or file")));
                }
                matcher(MatchKind::Ip, arg)
            }
            "source" => Expr::Source(self.argument(word)?),
            "from-has" => Expr::Has {
                kind: HasKind::From,
                opts: self.attributes(word, ADDR_NAMES)?,
            },
            "to-has" => Expr::Has {
                kind: HasKind::To,
                opts: self.attributes(word, ADDR_NAMES)?,
            },
            "helo-has" => Expr::Has {
                kind: HasKind::Helo,
                opts: self.attributes(word, HELO_NAMES)?,
            },
            "dns" => Expr::Has {
                kind: HasKind::Dns,
                opts: self.attributes(word, DNS_NAMES)?,
            },
            _ => return Err(self.syntax(format!("unknown match operator '{word}'"))),
        };
        Ok(expr)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) => format!("'{w}'"),
        Token::Quoted(q) => format!("\"{q}\""),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Semicolon => "';'".to_string(),
        Token::Eol => "end of line".to_string(),
        Token::Eof => "end of file".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn parse_one(text: &str) -> Rule {
        let mut rules = parse_str(text, "test.rules").unwrap();
        assert_eq!(rules.len(), 1, "expected one rule from {text:?}");
        rules.remove(0)
    }

    fn parse_err(text: &str) -> RuleError {
        match parse_str(text, "test.rules") {
            Ok(rules) => panic!("{text:?} parsed as {rules:?}"),
            Err(e) => e,
        }
    }

    fn m(kind: MatchKind, arg: &str) -> Expr {
        Expr::Match {
            kind,
            arg: arg.to_string(),
        }
    }

    #[test]
    fn test_or_binds_tighter_than_and() {
        let rule = parse_one("reject from info@fbi.gov to joe@example.com or jim@example.org");
        assert_eq!(rule.result, Action::Reject);
        assert_eq!(rule.requires, Phase::Rto);
        assert_eq!(rule.deferto, Phase::Any);
        assert_eq!(
            rule.clauses[0].expr,
            Expr::And(vec![
                m(MatchKind::From, "info@fbi.gov"),
                Expr::Or(
                    Box::new(m(MatchKind::To, "joe@example.com")),
                    Box::new(m(MatchKind::To, "jim@example.org")),
                ),
            ])
        );
    }

    #[test]
    fn test_not_and_parens() {
        let rule = parse_one(
            "@message reject (from info@fbi.gov or from @.mil or from bounce@) \\\n\
             \t to fred@example.net not host trusted.host\n",
        );
        assert_eq!(rule.deferto, Phase::Message);
        assert_eq!(
            rule.to_string(),
            "@message reject ( ( ( from info@fbi.gov or from @.mil ) or from bounce@ ) \
             to fred@example.net not host trusted.host )"
        );
    }

    #[test]
    fn test_shorthand_other_operators() {
        let rule = parse_one("stall helo-has none or nodots dnsbl a.example or b.example");
        assert_eq!(
            rule.to_string(),
            "stall ( ( helo-has none or helo-has nodots ) ( dnsbl a.example or dnsbl b.example ) )"
        );
        parse_err("reject all or something");
        parse_err("reject not from a@b or c@d");
    }

    #[test]
    fn test_compact_form() {
        let rule = parse_one(
            "set-with helo somehost with message \"That's nice\";\n\
             \t from a@b with message \"from a@b\" ;\n\
             \t from @b with message \"from @b\" note seen\n",
        );
        assert_eq!(rule.clauses.len(), 3);
        assert_eq!(rule.requires, Phase::Mfrom);
        assert_eq!(rule.clauses[2].withs.get("note").map(String::as_str), Some("seen"));

        let rules = parse_str("set-with all with note a;\n all with note b\nstall all\n", "t").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].clauses.len(), 2);
    }

    #[test]
    fn test_clause_must_follow_semicolon_directly() {
        for text in [
            "set-with all with note a;\n\n all with note b\n",
            "set-with all with note a;\n# between\n all with note b\n",
            "reject all;\n",
        ] {
            let err = parse_err(text);
            assert!(matches!(err, RuleError::Syntax { .. }), "{text:?} gave {err}");
            assert!(err.to_string().ends_with("rule ends with ';'"), "{err}");
        }
    }

    #[test]
    fn test_round_trip() {
        let sources = [
            "reject from info@fbi.gov to joe@example.com or jim@example.org",
            "@helo accept host .friend.com",
            "@data reject not ( tls on ip 192.0.2.0/24 ) with message \"no \\\"tls\\\"\"",
            "set-with from @a.b with message Hi; all with message Bye make-yakker",
            "reject dbl helo,host,from dbl.example dns nodns,inconsistent",
            "stall from-has bad,quoted to-has resolves or unknown",
            "reject source file:/etc/sources or ip ./ips",
            "@connect accept ip 2001:db8::/32 with tls-opt no-client savedir \"/var/spool/a b\"",
            "reject helo \"\" or ehlo \"(odd)\"",
            "reject all with message \"\" note \"\" make-yakker",
        ];
        for source in sources {
            let first = parse_one(source);
            let rendered = first.to_string();
            let second = parse_one(&rendered);
            assert_eq!(first, second, "{source:?} rendered as {rendered:?}");
            assert_eq!(rendered, second.to_string());
        }
    }

    #[test]
    fn test_phase_checks() {
        let err = parse_err("@from reject to joe@example.com");
        assert!(matches!(err, RuleError::Semantic { .. }), "{err}");
        assert_eq!(
            err.to_string(),
            "test.rules:1: rule needs @to data but is restricted to @from"
        );
        assert!(matches!(parse_err("@helo reject tls on"), RuleError::Semantic { .. }));
        assert!(matches!(parse_err("@helo reject dbl from d.example"), RuleError::Semantic { .. }));

        assert_eq!(parse_one("@to reject from-has bad").requires, Phase::Mfrom);
        assert_eq!(parse_one("reject dbl any d.example").requires, Phase::Mfrom);
        assert_eq!(parse_one("reject dbl helo d.example").requires, Phase::Helo);
        assert_eq!(parse_one("reject dnsbl d.example").requires, Phase::Connect);
        assert_eq!(parse_one("stall all").requires, Phase::Any);
    }

    #[test]
    fn test_set_with_needs_options() {
        assert!(matches!(parse_err("set-with all"), RuleError::Semantic { .. }));
        assert!(matches!(parse_err("set-with all; from a@b"), RuleError::Semantic { .. }));
        parse_one("set-with all; from a@b with note x");
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            "reject",
            "reject (from a@b",
            "reject from a@b)",
            "reject (from a@b\n to c@d)",
            "reject \"helo\" .local",
            "bounce all",
            "@later reject all",
            "reject frm a@b",
            "reject from",
            "reject tls maybe",
            "reject ip not-an-ip",
            "reject from-has good",
            "reject helo-has resolves",
            "reject dns bad",
            "reject dbl nowhere d.example",
            "reject all with",
            "reject all with colour red",
            "reject all with tls-opt on",
            "reject all with note \"two\nlines\"",
            "reject all;",
            "reject all with message",
            "reject (all with note x)",
        ];
        for text in cases {
            let err = parse_err(text);
            assert!(
                matches!(err, RuleError::Syntax { .. }),
                "{text:?} gave {err}"
            );
        }
        assert!(matches!(parse_err("reject helo \"x"), RuleError::Lex { .. }));
    }

    #[test]
    fn test_error_location() {
        let err = parse_err("# header\nreject all\n\nreject nothing-here x\n");
        assert_eq!(
            err.to_string(),
            "test.rules:4: unknown match operator 'nothing-here'"
        );
    }

    #[test]
    fn test_empty_and_comment_only() {
        assert!(parse_str("", "t").unwrap().is_empty());
        assert!(parse_str("# nothing\n\n   \n", "t").unwrap().is_empty());
    }

    #[test]
    fn test_includes() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner.rules");
        let outer = dir.path().join("outer.rules");
        let inner_path = inner.to_str().unwrap().to_string();
        let outer_path = outer.to_str().unwrap().to_string();

        std::fs::write(&inner, "@data reject all\n").unwrap();
        let mut f = std::fs::File::create(&outer).unwrap();
        writeln!(f, "accept host .friend.com").unwrap();
        writeln!(f, "include {inner_path}").unwrap();
        writeln!(f, "stall all").unwrap();
        drop(f);

        let rules = parse_file(&outer_path).unwrap();
        let text: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            text,
            vec!["accept host .friend.com", "@data reject all", "stall all"]
        );

        std::fs::write(&inner, format!("include {outer_path}\n")).unwrap();
        let err = parse_file(&outer_path).unwrap_err();
        assert!(matches!(err, RuleError::Semantic { .. }), "{err}");

        let err = parse_str("stall all\ninclude /no/such/rules\n", "t").unwrap_err();
        match &err {
            RuleError::Include { location, source } => {
                assert_eq!(location.to_string(), "t:2");
                assert!(matches!(**source, RuleError::Io { .. }), "{source}");
            }
            other => panic!("expected an include error, got {other}"),
        }
        assert!(err.to_string().starts_with("t:2: cannot include /no/such/rules: "));
    }
}
