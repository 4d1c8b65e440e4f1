// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scheduler loop configuration.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Scheduler loop configuration (runtime, fully resolved).
#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// Host name the agent registers under and matches host-affine jobs against.
	pub station: String,
	/// Sleep between scheduler cycles.
	pub poll_interval: Duration,
	/// Sleep between failed connection attempts.
	pub reconnect_wait: Duration,
	pub max_connect_attempts: u32,
	pub max_concurrent_jobs: usize,
	/// Halt instead of continuing when the installed schema version differs.
	pub enforce_schema_version: bool,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			station: "localhost".to_string(),
			poll_interval: Duration::from_secs(5),
			reconnect_wait: Duration::from_secs(30),
			max_connect_attempts: 10,
			max_concurrent_jobs: 16,
			enforce_schema_version: false,
		}
	}
}

/// Scheduler loop configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfigLayer {
	#[serde(default)]
	pub station: Option<String>,
	#[serde(default)]
	pub poll_interval_secs: Option<u64>,
	#[serde(default)]
	pub reconnect_wait_secs: Option<u64>,
	#[serde(default)]
	pub max_connect_attempts: Option<u32>,
	#[serde(default)]
	pub max_concurrent_jobs: Option<usize>,
	#[serde(default)]
	pub enforce_schema_version: Option<bool>,
}

impl AgentConfigLayer {
	pub fn merge(&mut self, other: AgentConfigLayer) {
		if other.station.is_some() {
			self.station = other.station;
		}
		if other.poll_interval_secs.is_some() {
			self.poll_interval_secs = other.poll_interval_secs;
		}
		if other.reconnect_wait_secs.is_some() {
			self.reconnect_wait_secs = other.reconnect_wait_secs;
		}
		if other.max_connect_attempts.is_some() {
			self.max_connect_attempts = other.max_connect_attempts;
		}
		if other.max_concurrent_jobs.is_some() {
			self.max_concurrent_jobs = other.max_concurrent_jobs;
		}
		if other.enforce_schema_version.is_some() {
			self.enforce_schema_version = other.enforce_schema_version;
		}
	}

	pub fn finalize(self) -> Result<AgentConfig, ConfigError> {
		let defaults = AgentConfig::default();

		let poll_interval_secs = self.poll_interval_secs.unwrap_or(5);
		if poll_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "agent.poll_interval_secs".to_string(),
				message: "poll interval must be greater than zero".to_string(),
			});
		}

		let reconnect_wait_secs = self.reconnect_wait_secs.unwrap_or(30);
		if reconnect_wait_secs < 10 {
			return Err(ConfigError::InvalidValue {
				key: "agent.reconnect_wait_secs".to_string(),
				message: "reconnect wait must be at least 10 seconds".to_string(),
			});
		}

		let max_concurrent_jobs = self
			.max_concurrent_jobs
			.unwrap_or(defaults.max_concurrent_jobs);
		if max_concurrent_jobs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "agent.max_concurrent_jobs".to_string(),
				message: "at least one concurrent job is required".to_string(),
			});
		}

		let station = self
			.station
			.filter(|s| !s.is_empty())
			.unwrap_or_else(local_station);

		Ok(AgentConfig {
			station,
			poll_interval: Duration::from_secs(poll_interval_secs),
			reconnect_wait: Duration::from_secs(reconnect_wait_secs),
			max_connect_attempts: self
				.max_connect_attempts
				.unwrap_or(defaults.max_connect_attempts)
				.max(1),
			max_concurrent_jobs,
			enforce_schema_version: self.enforce_schema_version.unwrap_or(false),
		})
	}
}

fn local_station() -> String {
	match hostname::get() {
		Ok(name) => name.to_string_lossy().into_owned(),
		Err(e) => {
			warn!(error = %e, "could not determine host name, registering as localhost");
			"localhost".to_string()
		}
	}
}
