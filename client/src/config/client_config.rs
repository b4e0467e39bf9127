//! Client configuration.

use std::path::PathBuf;

use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Holds raw client config parsed from YAML file.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
struct RawClientConfig {
    pub seed: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub ncpus: Option<u32>,
    pub cpu_sched_period: Option<f64>,
    pub host_flops: Option<f64>,
    pub work_buf_secs: Option<f64>,
    pub max_text_len: Option<usize>,
    pub rpc_backoff: Option<BackoffPolicy>,
    pub min_report_interval: Option<f64>,
    pub randomize_first_url: Option<bool>,
    pub file_deletion: Option<FileDeletionPolicy>,
}

/// Delay before the next scheduler RPC after `n` consecutive failures.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    // delay after the first failure (s)
    pub min_secs: f64,
    // cap for any number of failures (s)
    pub max_secs: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_secs: 60.,
            max_secs: 4. * 60. * 60.,
        }
    }
}

impl BackoffPolicy {
    /// Doubles per failure starting from `min_secs`, capped at `max_secs`.
    /// Non-decreasing in `nfailures`.
    pub fn delay(&self, nfailures: u32) -> f64 {
        if nfailures == 0 {
            return 0.;
        }
        let exp = (nfailures - 1).min(62) as i32;
        (self.min_secs * 2f64.powi(exp)).min(self.max_secs)
    }
}

/// What happens to the bytes of a file once nothing references it.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileDeletionPolicy {
    // delete during the next garbage collection
    #[default]
    Eager,
    // keep on disk until `ClientState::delete_file` is called
    Retain,
}

/// Represents client configuration.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub seed: u64,
    // root of the per-project file directories
    pub data_dir: PathBuf,
    // number of CPUs handed out per scheduling pass
    pub ncpus: u32,
    // length of a scheduling quantum (s)
    pub cpu_sched_period: f64,
    // host speed used to turn fpops estimates into seconds (FLOPS)
    pub host_flops: f64,
    // amount of queued work the client tries to keep (s)
    pub work_buf_secs: f64,
    // longest accepted name/URL (bytes)
    pub max_text_len: usize,
    pub rpc_backoff: BackoffPolicy,
    // minimum gap between "deferring communication" messages (s)
    pub min_report_interval: f64,
    // pick the first mirror of a new file at random
    pub randomize_first_url: bool,
    pub file_deletion: FileDeletionPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_raw(RawClientConfig::default())
    }
}

impl ClientConfig {
    /// Creates client config by reading parameter values from YAML file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(file_name)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawClientConfig = serde_yaml::from_str(text)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawClientConfig) -> Self {
        Self {
            seed: raw.seed.unwrap_or(124),
            data_dir: raw.data_dir.unwrap_or_else(|| PathBuf::from(".")),
            ncpus: raw.ncpus.unwrap_or(1).max(1),
            cpu_sched_period: raw.cpu_sched_period.unwrap_or(3600.),
            host_flops: raw.host_flops.unwrap_or(1e9),
            work_buf_secs: raw.work_buf_secs.unwrap_or(86400.),
            max_text_len: raw.max_text_len.unwrap_or(256),
            rpc_backoff: raw.rpc_backoff.unwrap_or_default(),
            min_report_interval: raw.min_report_interval.unwrap_or(3600.),
            randomize_first_url: raw.randomize_first_url.unwrap_or(false),
            file_deletion: raw.file_deletion.unwrap_or_default(),
        }
    }

    pub fn rng(&self) -> Pcg64 {
        Pcg64::seed_from_u64(self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ClientConfig::from_yaml("ncpus: 4\nrpc_backoff:\n  min_secs: 10\n  max_secs: 100\n")
            .unwrap();
        assert_eq!(config.ncpus, 4);
        assert_eq!(config.max_text_len, 256);
        assert_eq!(config.rpc_backoff.min_secs, 10.);
        assert_eq!(config.file_deletion, FileDeletionPolicy::Eager);
    }

    #[test]
    fn deletion_policy_parses_snake_case() {
        let config = ClientConfig::from_yaml("file_deletion: retain\n").unwrap();
        assert_eq!(config.file_deletion, FileDeletionPolicy::Retain);
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = BackoffPolicy {
            min_secs: 60.,
            max_secs: 1000.,
        };
        assert_eq!(policy.delay(0), 0.);
        assert_eq!(policy.delay(1), 60.);
        assert_eq!(policy.delay(2), 120.);
        let mut prev = 0.;
        for n in 0..200 {
            let d = policy.delay(n);
            assert!(d >= prev);
            assert!(d <= 1000.);
            prev = d;
        }
        assert_eq!(policy.delay(200), 1000.);
    }
}
