// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::env::load_secret_env;
use crate::error::ConfigError;
use crate::layer::ConfigLayer;
use crate::sections::{
	AgentConfigLayer, AlertsConfigLayer, DatabaseConfigLayer, LoggingConfigLayer, SmtpConfigLayer,
	TlsMode,
};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		Ok(ConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file is skipped.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/pgagent/pgagent.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ConfigLayer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: `PGAGENT_<SECTION>_<FIELD>`. The mail settings also honour the
/// legacy `MY_MAIL`, `REC_MAIL` and `MAIL_PASS` variables.
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ConfigLayer {
			database: Some(load_database_from_env()?),
			agent: Some(load_agent_from_env()?),
			alerts: Some(load_alerts_from_env()?),
			smtp: Some(load_smtp_from_env()?),
			logging: Some(load_logging_from_env()),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str, kind: &str) -> Result<Option<T>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid {kind} value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_path(name: &str) -> Option<PathBuf> {
	env_var(name).map(PathBuf::from)
}

fn split_list(value: String) -> Vec<String> {
	value
		.split(',')
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.collect()
}

fn load_database_from_env() -> Result<DatabaseConfigLayer, ConfigError> {
	Ok(DatabaseConfigLayer {
		url: env_var("PGAGENT_DATABASE_URL"),
		channel: env_var("PGAGENT_DATABASE_CHANNEL"),
		max_connections: env_parse("PGAGENT_DATABASE_MAX_CONNECTIONS", "u32")?,
		idle_timeout_secs: env_parse("PGAGENT_DATABASE_IDLE_TIMEOUT_SECS", "u64")?,
		drain_timeout_ms: env_parse("PGAGENT_DATABASE_DRAIN_TIMEOUT_MS", "u64")?,
	})
}

fn load_agent_from_env() -> Result<AgentConfigLayer, ConfigError> {
	Ok(AgentConfigLayer {
		station: env_var("PGAGENT_STATION"),
		poll_interval_secs: env_parse("PGAGENT_POLL_INTERVAL_SECS", "u64")?,
		reconnect_wait_secs: env_parse("PGAGENT_RECONNECT_WAIT_SECS", "u64")?,
		max_connect_attempts: env_parse("PGAGENT_MAX_CONNECT_ATTEMPTS", "u32")?,
		max_concurrent_jobs: env_parse("PGAGENT_MAX_CONCURRENT_JOBS", "usize")?,
		enforce_schema_version: env_bool("PGAGENT_ENFORCE_SCHEMA_VERSION"),
	})
}

fn load_alerts_from_env() -> Result<AlertsConfigLayer, ConfigError> {
	Ok(AlertsConfigLayer {
		aggregation_window_secs: env_parse("PGAGENT_ALERTS_WINDOW_SECS", "u64")?,
		max_batch_size: env_parse("PGAGENT_ALERTS_MAX_BATCH_SIZE", "usize")?,
		min_check_interval_secs: env_parse("PGAGENT_ALERTS_CHECK_INTERVAL_SECS", "u64")?,
		artifact_dir: env_path("PGAGENT_ALERTS_ARTIFACT_DIR"),
		fallback_dir: env_path("PGAGENT_ALERTS_FALLBACK_DIR"),
		max_send_attempts: env_parse("PGAGENT_ALERTS_MAX_SEND_ATTEMPTS", "u32")?,
		send_timeout_secs: env_parse("PGAGENT_ALERTS_SEND_TIMEOUT_SECS", "u64")?,
		job_log_dir: env_path("PGAGENT_ALERTS_JOB_LOG_DIR"),
		application_log: env_path("PGAGENT_ALERTS_APPLICATION_LOG"),
		application_log_tail_lines: env_parse("PGAGENT_ALERTS_APPLICATION_LOG_LINES", "usize")?,
		meminfo_path: None,
		loadavg_path: None,
	})
}

fn load_smtp_from_env() -> Result<SmtpConfigLayer, ConfigError> {
	let tls_mode = env_var("PGAGENT_SMTP_TLS")
		.map(|v| TlsMode::from_str_value(&v))
		.transpose()?;

	let password = match load_secret_env("PGAGENT_SMTP_PASSWORD")
		.map_err(|e| ConfigError::Secret(e.to_string()))?
	{
		Some(secret) => Some(secret),
		None => load_secret_env("MAIL_PASS").map_err(|e| ConfigError::Secret(e.to_string()))?,
	};

	Ok(SmtpConfigLayer {
		host: env_var("PGAGENT_SMTP_HOST"),
		port: env_parse("PGAGENT_SMTP_PORT", "u16")?,
		username: env_var("PGAGENT_SMTP_USERNAME"),
		password,
		from_address: env_var("PGAGENT_SMTP_FROM_ADDRESS").or_else(|| env_var("MY_MAIL")),
		from_name: env_var("PGAGENT_SMTP_FROM_NAME"),
		recipients: env_var("PGAGENT_SMTP_RECIPIENTS")
			.or_else(|| env_var("REC_MAIL"))
			.map(split_list),
		tls_mode,
	})
}

fn load_logging_from_env() -> LoggingConfigLayer {
	LoggingConfigLayer {
		level: env_var("PGAGENT_LOG_LEVEL"),
		json: env_bool("PGAGENT_LOG_JSON"),
	}
}
