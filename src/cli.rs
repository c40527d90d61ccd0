use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use crate::scheduler::DEFAULT_POLL_INTERVAL_SECS;

pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Flags after clap parsing. Selections stay strings here and are
/// validated case-insensitively by the types that own them.
#[derive(Debug, Clone)]
pub struct CliOptions {
    pub node: Option<String>,
    pub output: String,
    pub mode: String,
    pub poll_interval: u64,
    pub config: String,
    pub probe_timeout: u64,
    pub log_level: Option<String>,
    pub version: bool,
}

impl CliOptions {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let string = |id: &str| matches.get_one::<String>(id).cloned();
        Self {
            node: string("node").filter(|s| !s.is_empty()),
            output: string("output").unwrap_or_else(|| "pushgateway".into()),
            mode: string("mode").unwrap_or_else(|| "oneshot".into()),
            poll_interval: matches
                .get_one::<u64>("poll-interval")
                .copied()
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            config: string("config").unwrap_or_else(|| "metadata".into()),
            probe_timeout: matches
                .get_one::<u64>("probe-timeout")
                .copied()
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
            log_level: string("log-level"),
            version: matches.get_flag("version")
                || matches.subcommand_name() == Some("version"),
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("limitometer")
        .about("Collects the number of remaining requests in Azure Resource Manager")
        .arg(
            Arg::new("node")
                .long("node")
                .num_args(1)
                .env("NODE_NAME")
                .help("VM in the resource group used for compute queries (default: the configured VM name)"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .num_args(1)
                .default_value("pushgateway")
                .help("Target output, supported values are: [influxdb|pushgateway]"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .num_args(1)
                .default_value("oneshot")
                .help("Operational mode, supported values are: [oneshot|service]"),
        )
        .arg(
            Arg::new("poll-interval")
                .long("poll-interval")
                .num_args(1)
                .value_parser(value_parser!(u64).range(1..))
                .default_value("60")
                .help("Only for 'service' mode: poll interval for refreshing metrics in seconds"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .num_args(1)
                .env("LIMITOMETER_CONFIG")
                .default_value("metadata")
                .help("Where to load config from, supported values are: [metadata|environment]"),
        )
        .arg(
            Arg::new("probe-timeout")
                .long("probe-timeout")
                .num_args(1)
                .value_parser(value_parser!(u64).range(1..))
                .default_value("10")
                .help("Timeout for each control-plane call in seconds"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("version").about("Print version and exit"))
}

pub fn init_logging(level: Option<&str>) {
    // Respect explicit level, else default to info, allow env override via RUST_LOG
    if let Some(lvl) = level {
        std::env::set_var("RUST_LOG", lvl);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliOptions {
        let mut argv = vec!["limitometer"];
        argv.extend_from_slice(args);
        CliOptions::from_matches(&build_cli().get_matches_from(argv))
    }

    #[test]
    fn defaults() {
        let opts = parse(&["--config", "environment"]);
        assert_eq!(opts.output, "pushgateway");
        assert_eq!(opts.mode, "oneshot");
        assert_eq!(opts.poll_interval, 60);
        assert_eq!(opts.probe_timeout, 10);
        assert_eq!(opts.config, "environment");
        assert!(!opts.version);
    }

    #[test]
    fn explicit_flags() {
        let opts = parse(&[
            "--node",
            "node-0",
            "--output",
            "InfluxDB",
            "--mode",
            "service",
            "--poll-interval",
            "5",
            "--config",
            "environment",
        ]);
        assert_eq!(opts.node.as_deref(), Some("node-0"));
        assert_eq!(opts.output, "InfluxDB");
        assert_eq!(opts.mode, "service");
        assert_eq!(opts.poll_interval, 5);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let res = build_cli().try_get_matches_from(["limitometer", "--poll-interval", "0"]);
        assert!(res.is_err());
    }

    #[test]
    fn version_subcommand() {
        assert!(parse(&["version"]).version);
        assert!(parse(&["--version"]).version);
    }
}
