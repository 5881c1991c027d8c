use anyhow::Context as _;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use serde::Serialize;
use sinksmtp_rules::dns::lookup_reverse;
use sinksmtp_rules::{
    build_ruleset, load_ruleset, Action, Config, Context, Decision, FilePatterns, HeloVerb,
    HickoryDns, Phase, Ruleset,
};
use std::net::IpAddr;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("sinksmtp-rules")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Check and exercise sinkhole SMTP control rules")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/sinksmtp-rules.yaml"),
        )
        .arg(
            Arg::new("rules")
                .short('r')
                .long("rules")
                .value_name("FILE[,FILE...]")
                .help("Additional rule files, checked after those in the configuration")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("nostdrules")
                .long("nostdrules")
                .help("Do not include the standard HELO and address rules")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-rules")
                .long("test-rules")
                .help("Parse the rules and print them in canonical form")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("remote-ip")
                .long("remote-ip")
                .value_name("IP")
                .help("Client IP of the simulated connection")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("local-ip")
                .long("local-ip")
                .value_name("IP")
                .help("Server IP of the simulated connection")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("helo")
                .long("helo")
                .value_name("NAME")
                .help("HELO/EHLO name the client gives")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("helo-verb")
                .long("helo-verb")
                .value_name("VERB")
                .help("Whether the client says HELO or EHLO")
                .value_parser(["helo", "ehlo"])
                .default_value("ehlo"),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .value_name("ADDRESS")
                .help("MAIL FROM address (may be empty for the null sender)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .value_name("ADDRESS")
                .help("RCPT TO address, may be repeated")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("The client starts TLS before MAIL FROM")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print decisions as JSON, one object per line")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging of rule evaluation and DNS lookups")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-rules") {
        match build_ruleset(&config) {
            Ok(ruleset) => {
                for rule in &ruleset.rules {
                    println!("{rule}");
                }
            }
            Err(e) => {
                eprintln!("Rule error: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = simulate(&config, &matches).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/sinksmtp-rules.yaml");
    let mut config = if std::path::Path::new(path).exists() {
        Config::from_file(path).with_context(|| format!("reading {path}"))?
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Config::default()
    };

    if let Some(files) = matches.get_one::<String>("rules") {
        config.rule_files.extend(
            files
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string),
        );
    }
    if matches.get_flag("nostdrules") {
        config.std_rules = false;
    }
    Ok(config)
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

#[derive(Serialize)]
struct PhaseReport<'a> {
    phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    rcpt: Option<&'a str>,
    #[serde(flatten)]
    decision: &'a Decision,
}

struct Simulation {
    ruleset: Ruleset,
    ctx: Context,
    json: bool,
}

impl Simulation {
    /// Scan at `phase` and report. Returns false once the conversation is
    /// over.
    async fn step(&mut self, phase: Phase, rcpt: Option<&str>) -> anyhow::Result<bool> {
        let decision = self.ruleset.decide(phase, &mut self.ctx).await;
        if self.json {
            let report = PhaseReport {
                phase,
                rcpt,
                decision: &decision,
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            let mut line = format!("{phase}: {}", decision.action);
            if let Some(rcpt) = rcpt {
                line.push_str(&format!(" <{rcpt}>"));
            }
            for (name, value) in &decision.withprops {
                if name == "make-yakker" {
                    line.push_str(&format!(" {name}"));
                } else {
                    line.push_str(&format!(" {name}={value:?}"));
                }
            }
            println!("{line}");
        }
        Ok(!matches!(decision.action, Action::Reject | Action::Stall))
    }
}

fn parse_ip(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<IpAddr>> {
    matches
        .get_one::<String>(name)
        .map(|ip| {
            ip.parse::<IpAddr>()
                .with_context(|| format!("--{name}: '{ip}' is not an IP address"))
        })
        .transpose()
}

/// Drive a conversation through the rules, phase by phase, stopping at
/// the first reject or stall.
async fn simulate(config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    let dns = match HickoryDns::from_system_conf(config.dns_timeout_seconds) {
        Ok(dns) => Arc::new(dns),
        Err(e) => {
            log::warn!("Could not set up DNS resolver from system configuration: {e}");
            return Err(e.context("setting up DNS resolver"));
        }
    };
    let mut ctx = Context::new(dns.clone(), Arc::new(FilePatterns::new()));
    ctx.remote_ip = parse_ip(matches, "remote-ip")?;
    ctx.local_ip = parse_ip(matches, "local-ip")?;
    if let Some(ip) = ctx.remote_ip {
        ctx.rdns = lookup_reverse(dns.as_ref(), ip).await;
        log::debug!("Reverse DNS for {ip}: {:?}", ctx.rdns);
    }

    let mut sim = Simulation {
        ruleset: load_ruleset(config),
        ctx,
        json: matches.get_flag("json"),
    };

    if !sim.step(Phase::Connect, None).await? {
        return Ok(());
    }

    let Some(helo) = matches.get_one::<String>("helo") else {
        return Ok(());
    };
    sim.ctx.heloname = helo.clone();
    sim.ctx.helo_verb = match matches.get_one::<String>("helo-verb").map(String::as_str) {
        Some("helo") => Some(HeloVerb::Helo),
        _ => Some(HeloVerb::Ehlo),
    };
    if !sim.step(Phase::Helo, None).await? {
        return Ok(());
    }

    let Some(from) = matches.get_one::<String>("from") else {
        return Ok(());
    };
    sim.ctx.tls_on = matches.get_flag("tls");
    sim.ctx.from = from.clone();
    if !sim.step(Phase::Mfrom, None).await? {
        return Ok(());
    }

    let recipients: Vec<String> = matches
        .get_many::<String>("to")
        .map(|r| r.cloned().collect())
        .unwrap_or_default();
    if recipients.is_empty() {
        return Ok(());
    }
    for rcpt in &recipients {
        sim.ctx.rcptto = rcpt.clone();
        if !sim.step(Phase::Rto, Some(rcpt)).await? {
            return Ok(());
        }
    }

    if sim.step(Phase::Data, None).await? {
        sim.step(Phase::Message, None).await?;
    }
    if !sim.ctx.dnsbl_hits.is_empty() {
        log::info!("DNS blocklist hits: {}", sim.ctx.dnsbl_hits.join(", "));
    }
    Ok(())
}
