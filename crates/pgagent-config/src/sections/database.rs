// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Database configuration.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost/postgres";
pub const DEFAULT_STATUS_CHANNEL: &str = "job_status_update";

/// Database configuration (runtime, fully resolved).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
	pub url: String,
	/// Pub/sub channel carrying job status events.
	pub channel: String,
	pub max_connections: u32,
	/// Pooled connections idle for longer than this are closed.
	pub idle_timeout: Duration,
	/// Upper bound for a single receive while draining the channel.
	pub drain_timeout: Duration,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		DatabaseConfigLayer::default().finalize()
	}
}

/// Database configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfigLayer {
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub channel: Option<String>,
	#[serde(default)]
	pub max_connections: Option<u32>,
	#[serde(default)]
	pub idle_timeout_secs: Option<u64>,
	#[serde(default)]
	pub drain_timeout_ms: Option<u64>,
}

impl DatabaseConfigLayer {
	pub fn merge(&mut self, other: DatabaseConfigLayer) {
		if other.url.is_some() {
			self.url = other.url;
		}
		if other.channel.is_some() {
			self.channel = other.channel;
		}
		if other.max_connections.is_some() {
			self.max_connections = other.max_connections;
		}
		if other.idle_timeout_secs.is_some() {
			self.idle_timeout_secs = other.idle_timeout_secs;
		}
		if other.drain_timeout_ms.is_some() {
			self.drain_timeout_ms = other.drain_timeout_ms;
		}
	}

	pub fn finalize(self) -> DatabaseConfig {
		DatabaseConfig {
			url: self
				.url
				.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
			channel: self
				.channel
				.filter(|c| !c.is_empty())
				.unwrap_or_else(|| DEFAULT_STATUS_CHANNEL.to_string()),
			max_connections: self.max_connections.unwrap_or(8).max(2),
			idle_timeout: Duration::from_secs(self.idle_timeout_secs.unwrap_or(300)),
			drain_timeout: Duration::from_millis(self.drain_timeout_ms.unwrap_or(100)),
		}
	}
}
