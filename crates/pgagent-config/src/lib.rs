// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration management for the pgagent scheduler.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with validation
//! - Consistent environment variable naming (`PGAGENT_*`)
//! - A zeroizing [`Secret`] type for the mail relay credential
//!
//! # Usage
//!
//! ```ignore
//! use pgagent_config::load_config;
//!
//! let config = load_config()?;
//! println!("registering as {}", config.agent.station);
//! ```

pub mod env;
pub mod error;
pub mod layer;
pub mod sections;
pub mod secret;
pub mod sources;

pub use env::{load_secret_env, SecretEnvError};
pub use error::ConfigError;
pub use layer::ConfigLayer;
pub use sections::*;
pub use secret::{Secret, SecretString, REDACTED};
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use std::path::PathBuf;

use tracing::{debug, info};

/// Fully resolved agent configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
	pub database: DatabaseConfig,
	pub agent: AgentConfig,
	pub alerts: AlertsConfig,
	/// `None` when sender, recipients or credential are missing.
	pub smtp: Option<SmtpConfig>,
	pub logging: LoggingConfig,
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`PGAGENT_*`, plus the legacy mail variables)
/// 2. Config file (`/etc/pgagent/pgagent.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<Config, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(config_path: impl Into<PathBuf>) -> Result<Config, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<Config, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	finalize(merged)
}

/// Finalize configuration layer into resolved config.
pub fn finalize(layer: ConfigLayer) -> Result<Config, ConfigError> {
	let database = layer.database.unwrap_or_default().finalize();
	let agent = layer.agent.unwrap_or_default().finalize()?;
	let alerts = layer.alerts.unwrap_or_default().finalize()?;
	let smtp = layer.smtp.unwrap_or_default().finalize();
	let logging = layer.logging.unwrap_or_default().finalize();

	info!(
		station = %agent.station,
		channel = %database.channel,
		poll_interval_secs = agent.poll_interval.as_secs(),
		max_concurrent_jobs = agent.max_concurrent_jobs,
		alert_window_secs = alerts.aggregation_window.as_secs(),
		alert_batch_size = alerts.max_batch_size,
		smtp_configured = smtp.is_some(),
		"configuration loaded"
	);

	Ok(Config {
		database,
		agent,
		alerts,
		smtp,
		logging,
	})
}
