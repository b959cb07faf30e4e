use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::FinalConfig;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthCheckArgs {
    pub config: Option<PathBuf>,
    pub priority: Option<i64>,
    /// 0 runs a single sweep and exits.
    pub interval_secs: u64,
    pub cooldown_fatal_hours: Option<u64>,
    pub cooldown_throttle_minutes: Option<u64>,
    pub max_retries: Option<u32>,
    pub verbose: bool,
}

impl HealthCheckArgs {
    /// Flags win over the config file and the environment.
    pub fn apply(&self, config: &mut FinalConfig) {
        if let Some(v) = self.priority {
            config.health.priority_threshold = v;
        }
        if let Some(v) = self.cooldown_fatal_hours {
            config.health.cooldown_fatal_hours = v;
        }
        if let Some(v) = self.cooldown_throttle_minutes {
            config.health.cooldown_throttle_minutes = v;
        }
        if let Some(v) = self.max_retries {
            config.health.max_retries = v;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }
        // the standalone sweep owns the schedule
        config.health.interval_secs = 0;
        config.health.disabled_interval_secs = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Serve { config: Option<PathBuf> },
    HealthCheck(HealthCheckArgs),
    Help,
}

/// `-priority` style flags are accepted next to `--priority`.
fn normalize(arg: OsString) -> OsString {
    match arg.to_str() {
        Some(s) if s.len() > 2 && s.starts_with('-') && !s.starts_with("--") => OsString::from(format!("-{}", s)),
        _ => arg,
    }
}

pub fn parse(raw: Vec<OsString>) -> Result<Command, pico_args::Error> {
    let mut args = pico_args::Arguments::from_vec(raw.into_iter().map(normalize).collect());

    if args.contains(["-h", "--help"]) {
        return Ok(Command::Help);
    }

    let subcommand = args.subcommand()?.unwrap_or_else(|| "serve".into());
    let config: Option<PathBuf> = args.opt_value_from_str(["-c", "--config"])?;
    let command = match subcommand.as_str() {
        "serve" => Command::Serve { config },
        "health-check" => Command::HealthCheck(HealthCheckArgs {
            config,
            priority: args.opt_value_from_str("--priority")?,
            interval_secs: args.opt_value_from_str("--interval")?.unwrap_or(0),
            cooldown_fatal_hours: args.opt_value_from_str("--cooldown-fatal")?,
            cooldown_throttle_minutes: args.opt_value_from_str("--cooldown-throttle")?,
            max_retries: args.opt_value_from_str("--max-retries")?,
            verbose: args.contains(["-v", "--verbose"]),
        }),
        other => {
            return Err(pico_args::Error::ArgumentParsingFailed {
                cause: format!("unknown command '{}'", other),
            })
        }
    };

    let remaining = args.finish();
    if !remaining.is_empty() {
        return Err(pico_args::Error::ArgumentParsingFailed {
            cause: format!("unexpected arguments: {:?}", remaining),
        });
    }
    Ok(command)
}

pub fn print_help() {
    println!(
        r#"
Usage: relay-gateway [COMMAND] [OPTIONS]

Commands:
  serve           Runs the relay server (default).
  health-check    Probes channels, disables failing ones and recovers cooled-down ones.

Options:
  -c, --config PATH         Config file (default: ./config.yaml when present)

health-check options:
  -priority N               Only probe channels with priority >= N
  -interval SEC             Seconds between sweeps, 0 runs once (default 0)
  -cooldown-fatal H         Hours before a fatally disabled channel is re-probed
  -cooldown-throttle M      Minutes before a throttled channel is re-probed
  -max-retries N            Recovery probes before a channel is left disabled
  -v                        Debug logging
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_default_is_serve() {
        assert_eq!(parse(args(&[])).unwrap(), Command::Serve { config: None });
        assert_eq!(
            parse(args(&["serve", "--config", "relay.yaml"])).unwrap(),
            Command::Serve { config: Some(PathBuf::from("relay.yaml")) }
        );
        assert_eq!(parse(args(&["--help"])).unwrap(), Command::Help);
    }

    #[test]
    fn test_health_check_flags() {
        let command = parse(args(&[
            "health-check",
            "-priority",
            "100",
            "-interval",
            "60",
            "-cooldown-fatal",
            "12",
            "-cooldown-throttle",
            "15",
            "-max-retries",
            "5",
            "-v",
        ]))
        .unwrap();
        let Command::HealthCheck(health) = command else {
            panic!("expected health-check");
        };
        assert_eq!(health.priority, Some(100));
        assert_eq!(health.interval_secs, 60);
        assert_eq!(health.max_retries, Some(5));
        assert!(health.verbose);

        let mut config = FinalConfig::default();
        config.health.interval_secs = 300;
        health.apply(&mut config);
        assert_eq!(config.health.priority_threshold, 100);
        assert_eq!(config.health.fatal_cooldown_secs(), 12 * 3600);
        assert_eq!(config.health.throttle_cooldown_secs(), 15 * 60);
        assert_eq!(config.health.max_retries, 5);
        assert_eq!(config.health.interval_secs, 0);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse(args(&["health-check", "-priority", "high"])).is_err());
        assert!(parse(args(&["health-check", "--bogus"])).is_err());
        assert!(parse(args(&["migrate"])).is_err());
    }
}
