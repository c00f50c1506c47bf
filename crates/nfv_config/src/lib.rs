#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `WorkerConfig`: YAML-loaded, validated tunables for the worker, merged
//! with CLI overrides. Load-then-validate-then-exit-2-on-failure, via
//! `serde_yaml::from_reader` + `Validate` + `Error::InvalidConfig{file,
//! message}`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

/// All the errors that can occur loading or validating a `WorkerConfig`.
/// These map to CLI exit code 2 (config/validation, fatal at startup).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be read or parsed.
    #[error("invalid configuration (file: {file}, reason: {message})")]
    InvalidConfig {
        /// The path of the offending file.
        file: String,
        /// The parse or IO error message.
        message: String,
    },

    /// The configuration parsed but failed validation.
    #[error("configuration failed validation (file: {file}, reason: {message})")]
    ValidationFailed {
        /// The path of the offending file.
        file: String,
        /// The validator error message.
        message: String,
    },
}

fn default_rss_size() -> u16 {
    512
}

fn default_sw_queue_pool_size() -> usize {
    40
}

fn default_ring_capacity() -> usize {
    2048
}

fn default_epoch_packet_thresh() -> u64 {
    8_000
}

fn default_short_epoch_ns() -> u64 {
    1_000_000
}

fn default_long_epoch_ns() -> u64 {
    1_000_000_000
}

fn default_migrate_headroom() -> f64 {
    0.1
}

fn default_assign_headroom() -> f64 {
    0.2
}

fn default_consolidation_min_liveness_epochs() -> u32 {
    4
}

fn default_sw_queue_idle_epochs_threshold() -> i64 {
    100
}

fn default_rss_update_min_interval_ns() -> u64 {
    5_000_000
}

fn default_large_queue_thresh_ratio() -> f64 {
    1.0
}

fn default_spare_normal_cores() -> u32 {
    4
}

/// A point on the monotone `max_pps_per_core(flow_count)` NF profile curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfilePoint {
    /// Flow count at this point.
    pub flow_count: u32,
    /// Maximum sustainable packets-per-second at this flow count.
    pub max_pps: f64,
}

/// Top-level worker configuration, validated after deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WorkerConfig {
    /// Number of Normal cores.
    #[validate(range(min = 1))]
    pub ncore: u32,

    /// Number of Reserved cores.
    pub rcore: u32,

    /// RSS indirection table size, must be a power of two, at most 512.
    #[serde(default = "default_rss_size")]
    pub rss_size: u16,

    /// Number of sw-queues in the pool (typical 40; need not itself be a
    /// power of two, only each ring's capacity must be).
    #[serde(default = "default_sw_queue_pool_size")]
    #[validate(range(min = 1))]
    pub sw_queue_pool_size: usize,

    /// Per-sw-queue ring capacity, must be a power of two.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Packets per short epoch above which a flow cannot stay local
    /// (typical 8,000).
    #[serde(default = "default_epoch_packet_thresh")]
    #[validate(range(min = 1))]
    pub epoch_packet_thresh: u64,

    /// Short-epoch period in nanoseconds (typical 1 ms).
    #[serde(default = "default_short_epoch_ns")]
    #[validate(range(min = 1))]
    pub short_epoch_ns: u64,

    /// Long-epoch period in nanoseconds (typical 1 s).
    #[serde(default = "default_long_epoch_ns")]
    #[validate(range(min = 1))]
    pub long_epoch_ns: u64,

    /// Headroom fraction (0.0-1.0) a core must be brought under before a
    /// must-migrate decision is considered satisfied.
    #[serde(default = "default_migrate_headroom")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub migrate_headroom: f64,

    /// Headroom fraction (0.0-1.0) used when placing a bucket onto a core.
    #[serde(default = "default_assign_headroom")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub assign_headroom: f64,

    /// Minimum consecutive long epochs a core must have been Normal before
    /// it is eligible for consolidation (typical 4).
    #[serde(default = "default_consolidation_min_liveness_epochs")]
    pub consolidation_min_liveness_epochs: u32,

    /// Consecutive idle short epochs after which an Active sw-queue
    /// transitions to Draining (typical 100).
    #[serde(default = "default_sw_queue_idle_epochs_threshold")]
    pub sw_queue_idle_epochs_threshold: i64,

    /// Minimum nanoseconds between successive `update_rss` NIC calls
    /// (typical 5 ms).
    #[serde(default = "default_rss_update_min_interval_ns")]
    pub rss_update_min_interval_ns: u64,

    /// Ratio of `epoch_packet_thresh` above which a local ring is
    /// considered "large" for the purposes of consecutive-large-queue
    /// tracking (typical 1.0: large means at the threshold itself).
    #[serde(default = "default_large_queue_thresh_ratio")]
    pub large_queue_thresh_ratio: f64,

    /// Monotone NF-profile curve: flow_count -> max sustainable pps.
    #[validate(length(min = 1))]
    pub profile_curve: Vec<ProfilePoint>,

    /// Number of additional core slots kept `Unused`, available for the
    /// Scheduler to activate as Normal cores when the long-term placement
    /// algorithm can't fit an overloaded bucket anywhere else.
    #[serde(default = "default_spare_normal_cores")]
    pub spare_normal_cores: u32,
}

impl WorkerConfig {
    /// Loads and validates a configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file_name = path.as_ref().display().to_string();
        debug!("loading {}", file_name);
        let file = File::open(&path).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(file);
        let config: WorkerConfig = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        config.validate().map_err(|err| Error::ValidationFailed {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        if !config.rss_size.is_power_of_two() || config.rss_size > 512 {
            return Err(Error::ValidationFailed {
                file: file_name.clone(),
                message: format!("rss_size must be a power of two <= 512, got {}", config.rss_size),
            });
        }

        if !config.ring_capacity.is_power_of_two() {
            return Err(Error::ValidationFailed {
                file: file_name.clone(),
                message: format!("ring_capacity must be a power of two, got {}", config.ring_capacity),
            });
        }

        if !config
            .profile_curve
            .windows(2)
            .all(|pair| pair[0].flow_count < pair[1].flow_count)
        {
            return Err(Error::ValidationFailed {
                file: file_name,
                message: "profile_curve must be strictly ascending by flow_count".to_string(),
            });
        }

        debug!("{} loaded", file_name);
        Ok(config)
    }

    /// Looks up `max_pps_per_core` for a given flow count by walking the
    /// monotone profile curve and returning the bound for the first point
    /// whose `flow_count` is >= the query (a simple step lookup; the curve
    /// is assumed pre-sorted ascending by `flow_count`).
    pub fn max_pps_per_core(&self, flow_count: u32) -> f64 {
        self.profile_curve
            .iter()
            .find(|point| point.flow_count >= flow_count)
            .or_else(|| self.profile_curve.last())
            .map(|point| point.max_pps)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        "ncore: 2\nrcore: 1\nprofile_curve:\n  - flow_count: 1000\n    max_pps: 1000000\n"
    }

    #[test]
    fn loads_with_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nfv_config_test_{}.yaml", std::process::id()));
        std::fs::write(&path, sample_yaml()).unwrap();

        let config = WorkerConfig::load(&path).expect("config should load");
        assert_eq!(config.ncore, 2);
        assert_eq!(config.rss_size, 512);
        assert_eq!(config.epoch_packet_thresh, 8_000);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_rss_size() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nfv_config_bad_{}.yaml", std::process::id()));
        std::fs::write(&path, "ncore: 1\nrcore: 0\nrss_size: 500\nprofile_curve:\n  - flow_count: 1\n    max_pps: 1.0\n").unwrap();

        let result = WorkerConfig::load(&path);
        assert!(result.is_err());

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_non_monotone_profile_curve() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nfv_config_nonmonotone_{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "ncore: 1\nrcore: 0\nprofile_curve:\n  - flow_count: 1000\n    max_pps: 1.0\n  - flow_count: 500\n    max_pps: 2.0\n",
        )
        .unwrap();

        let result = WorkerConfig::load(&path);
        assert!(result.is_err());

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn max_pps_per_core_steps_through_curve() {
        let config = WorkerConfig {
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
            profile_curve: vec![
                ProfilePoint {
                    flow_count: 1_000,
                    max_pps: 1_000_000.0,
                },
                ProfilePoint {
                    flow_count: 10_000,
                    max_pps: 500_000.0,
                },
            ],
        };

        assert_eq!(config.max_pps_per_core(500), 1_000_000.0);
        assert_eq!(config.max_pps_per_core(5_000), 500_000.0);
        assert_eq!(config.max_pps_per_core(50_000), 500_000.0);
    }
}
