//! Command-line argument parsing: a flat `env::args()` loop, no
//! argument-parsing crate — this binary's flag set is small and fixed.

use std::path::PathBuf;
use std::str::FromStr;

use nfv_config::WorkerConfig;

/// Parsed command-line flags: the required config file path, plus scalar
/// overrides applied on top of the loaded `WorkerConfig`.
pub struct Args {
    /// Path to the YAML configuration file.
    pub config_path: PathBuf,
    ncore: Option<u32>,
    rcore: Option<u32>,
    short_epoch_us: Option<u64>,
    long_epoch_ms: Option<u64>,
    rss_size: Option<u16>,
}

impl Args {
    /// Parses `--config <path>` (required) and the optional scalar
    /// overrides (`--ncore`, `--rcore`, `--short-epoch-us`,
    /// `--long-epoch-ms`, `--rss-size`). Returns a human-readable error
    /// message on any unrecognized, malformed, or missing argument.
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut config_path = None;
        let mut ncore = None;
        let mut rcore = None;
        let mut short_epoch_us = None;
        let mut long_epoch_ms = None;
        let mut rss_size = None;

        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--config" => config_path = Some(PathBuf::from(next_value(&mut args, "--config")?)),
                "--ncore" => ncore = Some(parse_value(&mut args, "--ncore")?),
                "--rcore" => rcore = Some(parse_value(&mut args, "--rcore")?),
                "--short-epoch-us" => short_epoch_us = Some(parse_value(&mut args, "--short-epoch-us")?),
                "--long-epoch-ms" => long_epoch_ms = Some(parse_value(&mut args, "--long-epoch-ms")?),
                "--rss-size" => rss_size = Some(parse_value(&mut args, "--rss-size")?),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => return Err(format!("unrecognized argument: {other}")),
            }
        }

        Ok(Self {
            config_path: config_path.ok_or_else(|| "missing required argument: --config <path>".to_string())?,
            ncore,
            rcore,
            short_epoch_us,
            long_epoch_ms,
            rss_size,
        })
    }

    /// Applies every provided override onto a loaded `WorkerConfig`. Flags
    /// left unset leave the file's value (or its default) untouched.
    pub fn apply_overrides(&self, config: &mut WorkerConfig) {
        if let Some(ncore) = self.ncore {
            config.ncore = ncore;
        }
        if let Some(rcore) = self.rcore {
            config.rcore = rcore;
        }
        if let Some(short_epoch_us) = self.short_epoch_us {
            config.short_epoch_ns = short_epoch_us * 1_000;
        }
        if let Some(long_epoch_ms) = self.long_epoch_ms {
            config.long_epoch_ns = long_epoch_ms * 1_000_000;
        }
        if let Some(rss_size) = self.rss_size {
            config.rss_size = rss_size;
        }
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_value<T: FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T, String> {
    let raw = next_value(args, flag)?;
    raw.parse().map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

/// Prints the command-line usage summary to stderr.
pub fn print_usage() {
    eprintln!("Usage: nfvd --config <path> [--ncore N] [--rcore N] [--short-epoch-us N] [--long-epoch-ms N] [--rss-size N]");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_a_config_path() {
        let result = Args::parse(std::iter::empty());
        assert!(result.is_err());
    }

    #[test]
    fn parses_config_path_and_overrides() {
        let raw = [
            "--config",
            "worker.yaml",
            "--ncore",
            "4",
            "--rcore",
            "2",
            "--short-epoch-us",
            "500",
            "--long-epoch-ms",
            "750",
            "--rss-size",
            "256",
        ]
        .into_iter()
        .map(String::from);

        let args = Args::parse(raw).expect("well-formed arguments should parse");
        assert_eq!(args.config_path, PathBuf::from("worker.yaml"));

        let mut config = minimal_config();
        args.apply_overrides(&mut config);
        assert_eq!(config.ncore, 4);
        assert_eq!(config.rcore, 2);
        assert_eq!(config.short_epoch_ns, 500_000);
        assert_eq!(config.long_epoch_ns, 750_000_000);
        assert_eq!(config.rss_size, 256);
    }

    #[test]
    fn rejects_unrecognized_flags() {
        let raw = ["--config", "worker.yaml", "--bogus", "1"].into_iter().map(String::from);
        assert!(Args::parse(raw).is_err());
    }

    #[test]
    fn rejects_non_numeric_override_values() {
        let raw = ["--config", "worker.yaml", "--ncore", "not-a-number"].into_iter().map(String::from);
        assert!(Args::parse(raw).is_err());
    }

    fn minimal_config() -> WorkerConfig {
        WorkerConfig {
            ncore: 1,
            rcore: 0,
            rss_size: 512,
            sw_queue_pool_size: 40,
            ring_capacity: 2048,
            epoch_packet_thresh: 8_000,
            short_epoch_ns: 1_000_000,
            long_epoch_ns: 1_000_000_000,
            migrate_headroom: 0.1,
            assign_headroom: 0.2,
            consolidation_min_liveness_epochs: 4,
            sw_queue_idle_epochs_threshold: 100,
            rss_update_min_interval_ns: 5_000_000,
            large_queue_thresh_ratio: 1.0,
            spare_normal_cores: 4,
            profile_curve: vec![nfv_config::ProfilePoint {
                flow_count: 1_000,
                max_pps: 1_000_000.0,
            }],
        }
    }
}
