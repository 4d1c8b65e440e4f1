// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Failure alert batching, rendering and diagnostics configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Alert pipeline configuration (runtime, fully resolved).
#[derive(Debug, Clone)]
pub struct AlertsConfig {
	/// A batch is flushed once its oldest record is this old.
	pub aggregation_window: Duration,
	/// A batch is flushed as soon as it holds this many records.
	pub max_batch_size: usize,
	/// Time-based flush checks run at most this often.
	pub min_check_interval: Duration,
	/// Directory receiving `job_failures_*.log` reports.
	pub artifact_dir: PathBuf,
	/// Directory receiving `failed_email_*.html` copies of undelivered alerts.
	pub fallback_dir: PathBuf,
	pub max_send_attempts: u32,
	pub send_timeout: Duration,
	pub job_log_dir: PathBuf,
	pub application_log: PathBuf,
	pub application_log_tail_lines: usize,
	pub meminfo_path: PathBuf,
	pub loadavg_path: PathBuf,
}

impl Default for AlertsConfig {
	fn default() -> Self {
		Self {
			aggregation_window: Duration::from_secs(60),
			max_batch_size: 250,
			min_check_interval: Duration::from_secs(5),
			artifact_dir: PathBuf::from("."),
			fallback_dir: PathBuf::from("."),
			max_send_attempts: 3,
			send_timeout: Duration::from_secs(30),
			job_log_dir: PathBuf::from("/var/log/jobs"),
			application_log: PathBuf::from("/var/log/application.log"),
			application_log_tail_lines: 50,
			meminfo_path: PathBuf::from("/proc/meminfo"),
			loadavg_path: PathBuf::from("/proc/loadavg"),
		}
	}
}

/// Alert pipeline configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfigLayer {
	#[serde(default)]
	pub aggregation_window_secs: Option<u64>,
	#[serde(default)]
	pub max_batch_size: Option<usize>,
	#[serde(default)]
	pub min_check_interval_secs: Option<u64>,
	#[serde(default)]
	pub artifact_dir: Option<PathBuf>,
	#[serde(default)]
	pub fallback_dir: Option<PathBuf>,
	#[serde(default)]
	pub max_send_attempts: Option<u32>,
	#[serde(default)]
	pub send_timeout_secs: Option<u64>,
	#[serde(default)]
	pub job_log_dir: Option<PathBuf>,
	#[serde(default)]
	pub application_log: Option<PathBuf>,
	#[serde(default)]
	pub application_log_tail_lines: Option<usize>,
	#[serde(default)]
	pub meminfo_path: Option<PathBuf>,
	#[serde(default)]
	pub loadavg_path: Option<PathBuf>,
}

impl AlertsConfigLayer {
	pub fn merge(&mut self, other: AlertsConfigLayer) {
		macro_rules! take {
			($($field:ident),* $(,)?) => {
				$(
					if other.$field.is_some() {
						self.$field = other.$field;
					}
				)*
			};
		}

		take!(
			aggregation_window_secs,
			max_batch_size,
			min_check_interval_secs,
			artifact_dir,
			fallback_dir,
			max_send_attempts,
			send_timeout_secs,
			job_log_dir,
			application_log,
			application_log_tail_lines,
			meminfo_path,
			loadavg_path,
		);
	}

	pub fn finalize(self) -> Result<AlertsConfig, ConfigError> {
		let defaults = AlertsConfig::default();

		let max_batch_size = self.max_batch_size.unwrap_or(defaults.max_batch_size);
		if max_batch_size == 0 {
			return Err(ConfigError::InvalidValue {
				key: "alerts.max_batch_size".to_string(),
				message: "batch size must be at least 1".to_string(),
			});
		}

		Ok(AlertsConfig {
			aggregation_window: self
				.aggregation_window_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.aggregation_window),
			max_batch_size,
			min_check_interval: self
				.min_check_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.min_check_interval),
			artifact_dir: self.artifact_dir.unwrap_or(defaults.artifact_dir),
			fallback_dir: self.fallback_dir.unwrap_or(defaults.fallback_dir),
			max_send_attempts: self
				.max_send_attempts
				.unwrap_or(defaults.max_send_attempts)
				.max(1),
			send_timeout: self
				.send_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.send_timeout),
			job_log_dir: self.job_log_dir.unwrap_or(defaults.job_log_dir),
			application_log: self.application_log.unwrap_or(defaults.application_log),
			application_log_tail_lines: self
				.application_log_tail_lines
				.unwrap_or(defaults.application_log_tail_lines),
			meminfo_path: self.meminfo_path.unwrap_or(defaults.meminfo_path),
			loadavg_path: self.loadavg_path.unwrap_or(defaults.loadavg_path),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = AlertsConfigLayer::default().finalize().unwrap();
		assert_eq!(config.aggregation_window, Duration::from_secs(60));
		assert_eq!(config.max_batch_size, 250);
		assert_eq!(config.min_check_interval, Duration::from_secs(5));
		assert_eq!(config.max_send_attempts, 3);
		assert_eq!(config.application_log_tail_lines, 50);
		assert_eq!(config.job_log_dir, PathBuf::from("/var/log/jobs"));
	}

	#[test]
	fn test_rejects_zero_batch_size() {
		let layer = AlertsConfigLayer {
			max_batch_size: Some(0),
			..Default::default()
		};
		assert!(layer.finalize().is_err());
	}

	#[test]
	fn test_send_attempts_floor_is_one() {
		let layer = AlertsConfigLayer {
			max_send_attempts: Some(0),
			..Default::default()
		};
		assert_eq!(layer.finalize().unwrap().max_send_attempts, 1);
	}

	#[test]
	fn test_merge_prefers_other() {
		let mut base = AlertsConfigLayer {
			aggregation_window_secs: Some(120),
			artifact_dir: Some(PathBuf::from("/srv/reports")),
			..Default::default()
		};
		base.merge(AlertsConfigLayer {
			aggregation_window_secs: Some(30),
			..Default::default()
		});
		assert_eq!(base.aggregation_window_secs, Some(30));
		assert_eq!(base.artifact_dir, Some(PathBuf::from("/srv/reports")));
	}
}
