//! Building the rule set for a connection.

use crate::config::Config;
use crate::rules::{parse_file, parse_str, RuleError, Ruleset};
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::Mutex;

lazy_static! {
    static ref REPORTED: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Parse the built-in rules and then every rule file, in order. Any
/// error fails the lot.
pub fn build_ruleset(config: &Config) -> Result<Ruleset, RuleError> {
    let mut rules = parse_str(&config.synthesized_rules(), "<options>")?;
    for file in &config.rule_files {
        rules.extend(parse_file(file)?);
    }
    log::debug!(
        "Loaded {} rules from {} rule files",
        rules.len(),
        config.rule_files.len()
    );
    Ok(Ruleset::new(rules))
}

/// The rule set for a new connection. If the rules can't be loaded the
/// connection gets a rule set that stalls everything, and the error is
/// logged (once per distinct error).
pub fn load_ruleset(config: &Config) -> Ruleset {
    match build_ruleset(config) {
        Ok(ruleset) => ruleset,
        Err(e) => {
            let message = e.to_string();
            if report_once(&message) {
                log::error!("Rule loading failed, stalling all connections: {message}");
            }
            Ruleset::stall_all()
        }
    }
}

/// Returns true the first time a given message is seen in this process.
pub fn report_once(message: &str) -> bool {
    match REPORTED.lock() {
        Ok(mut seen) => seen.insert(message.to_string()),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Action;

    #[test]
    fn test_builtin_rules_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.rules");
        std::fs::write(&path, "accept all\n").unwrap();

        let config = Config {
            rule_files: vec![path.to_str().unwrap().to_string()],
            always_reject: true,
            ..Default::default()
        };
        let ruleset = build_ruleset(&config).unwrap();
        let text: Vec<String> = ruleset.rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "reject from-has bad",
                "reject to-has bad",
                "reject helo-has none",
                "@message reject all",
                "accept all",
            ]
        );
    }

    #[test]
    fn test_broken_rules_stall_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.rules");
        std::fs::write(&path, "accept all\nreject frobnicate\n").unwrap();
        let config = Config {
            rule_files: vec![path.to_str().unwrap().to_string()],
            ..Default::default()
        };

        let err = build_ruleset(&config).unwrap_err();
        assert!(err.to_string().ends_with(":2: unknown match operator 'frobnicate'"));

        let ruleset = load_ruleset(&config);
        assert_eq!(ruleset, Ruleset::stall_all());
        assert_eq!(ruleset.rules[0].result, Action::Stall);
    }

    #[test]
    fn test_missing_rule_file_stalls() {
        let config = Config {
            rule_files: vec!["/no/such/rules".to_string()],
            ..Default::default()
        };
        assert!(matches!(build_ruleset(&config), Err(RuleError::Io { .. })));
        assert_eq!(load_ruleset(&config), Ruleset::stall_all());
    }

    #[test]
    fn test_report_once() {
        assert!(report_once("loader test: some unique error"));
        assert!(!report_once("loader test: some unique error"));
        assert!(report_once("loader test: another error"));
    }
}
