use serde::{Deserialize, Serialize};

/// Standard rules, checked first unless turned off.
pub const STANDARD_RULES: &[&str] = &[
    "reject from-has bad,route",
    "reject to-has bad,route",
    "reject helo-has none",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rule files, earlier files take priority.
    pub rule_files: Vec<String>,
    pub std_rules: bool,
    /// Reject every message after DATA.
    pub always_reject: bool,
    /// Address list file of MAIL FROMs to reject.
    pub from_reject: Option<String>,
    /// Address list file of the only RCPT TOs to accept.
    pub to_accept: Option<String>,
    /// Host list file of HELO names to reject, at MAIL FROM time.
    pub helo_reject: Option<String>,
    pub dns_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rule_files: Vec::new(),
            std_rules: true,
            always_reject: false,
            from_reject: None,
            to_accept: None,
            helo_reject: None,
            dns_timeout_seconds: 10,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Rule text for the options that are shorthands for rules. These go
    /// ahead of anything in the rule files.
    pub fn synthesized_rules(&self) -> String {
        let mut rules: Vec<String> = Vec::new();
        if self.std_rules {
            rules.extend(STANDARD_RULES.iter().map(|r| r.to_string()));
        }
        if self.always_reject {
            rules.push("@message reject all".to_string());
        }
        if let Some(file) = &self.from_reject {
            rules.push(format!("reject from {}", file_arg(file)));
        }
        if let Some(file) = &self.to_accept {
            rules.push(format!("reject not to {}", file_arg(file)));
        }
        if let Some(file) = &self.helo_reject {
            rules.push(format!("@from reject helo {}", file_arg(file)));
        }
        let mut text = rules.join("\n");
        text.push('\n');
        text
    }
}

fn file_arg(path: &str) -> String {
    crate::rules::lexer::render_arg(&format!("file:{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_synthesized_rules() {
        assert_eq!(
            Config::default().synthesized_rules(),
            "reject from-has bad,route\nreject to-has bad,route\nreject helo-has none\n"
        );
    }

    #[test]
    fn test_convenience_options() {
        let config = Config {
            std_rules: false,
            always_reject: true,
            from_reject: Some("/etc/sink/from".to_string()),
            to_accept: Some("to list".to_string()),
            helo_reject: Some("helos".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.synthesized_rules(),
            "@message reject all\n\
             reject from file:/etc/sink/from\n\
             reject not to \"file:to list\"\n\
             @from reject helo file:helos\n"
        );
    }

    #[test]
    fn test_yaml_round_trip_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.yaml");
        let path = path.to_str().unwrap();

        let config = Config {
            rule_files: vec!["/etc/sink/rules".to_string()],
            to_accept: Some("/etc/sink/to".to_string()),
            ..Default::default()
        };
        config.to_file(path).unwrap();
        assert_eq!(Config::from_file(path).unwrap(), config);

        std::fs::write(path, "rule_files: [a.rules]\nstd_rules: false\n").unwrap();
        let partial = Config::from_file(path).unwrap();
        assert_eq!(partial.rule_files, vec!["a.rules"]);
        assert!(!partial.std_rules);
        assert_eq!(partial.dns_timeout_seconds, 10);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::from_file("/no/such/config.yaml").is_err());
    }
}
