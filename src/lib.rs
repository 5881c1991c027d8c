pub mod classify;
pub mod config;
pub mod context;
pub mod dns;
pub mod loader;
pub mod patterns;
pub mod rules;

pub use config::Config;
pub use context::{Context, HeloVerb, ReverseDns};
pub use dns::{DnsResolver, DnsResult, HickoryDns};
pub use loader::{build_ruleset, load_ruleset};
pub use patterns::{FilePatterns, PatternSource};
pub use rules::{Action, Decision, Phase, RuleError, Ruleset};
