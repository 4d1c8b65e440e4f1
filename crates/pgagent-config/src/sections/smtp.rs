// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mail relay configuration for failure alerts.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::secret::SecretString;

pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
	/// Plain text connection.
	None,
	/// STARTTLS upgrade after connecting (required).
	#[default]
	StartTls,
	/// Implicit TLS.
	Tls,
}

impl TlsMode {
	pub fn from_str_value(value: &str) -> Result<Self, ConfigError> {
		match value.to_lowercase().as_str() {
			"true" | "tls" => Ok(TlsMode::Tls),
			"starttls" => Ok(TlsMode::StartTls),
			"false" | "none" => Ok(TlsMode::None),
			_ => Err(ConfigError::InvalidValue {
				key: "smtp.tls_mode".to_string(),
				message: format!("Invalid value: '{value}'. Expected: tls, starttls, none"),
			}),
		}
	}
}

/// Mail relay configuration layer (all fields optional for layering).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfigLayer {
	pub host: Option<String>,
	pub port: Option<u16>,
	/// Login name; defaults to the sender address.
	pub username: Option<String>,
	#[serde(skip_serializing)]
	pub password: Option<SecretString>,
	pub from_address: Option<String>,
	pub from_name: Option<String>,
	/// Default recipients when an alert carries no override.
	pub recipients: Option<Vec<String>>,
	pub tls_mode: Option<TlsMode>,
}

impl SmtpConfigLayer {
	pub fn merge(&mut self, other: SmtpConfigLayer) {
		if other.host.is_some() {
			self.host = other.host;
		}
		if other.port.is_some() {
			self.port = other.port;
		}
		if other.username.is_some() {
			self.username = other.username;
		}
		if other.password.is_some() {
			self.password = other.password;
		}
		if other.from_address.is_some() {
			self.from_address = other.from_address;
		}
		if other.from_name.is_some() {
			self.from_name = other.from_name;
		}
		if other.recipients.is_some() {
			self.recipients = other.recipients;
		}
		if other.tls_mode.is_some() {
			self.tls_mode = other.tls_mode;
		}
	}

	/// Resolve into a relay configuration, logging what is missing when the
	/// relay cannot be used.
	pub fn finalize(self) -> Option<SmtpConfig> {
		match self.build() {
			Ok(config) => Some(config),
			Err(missing) => {
				warn!(
					missing = %missing.join(", "),
					"mail relay not configured, failure alerts will be written to the fallback directory"
				);
				None
			}
		}
	}

	/// Build the final config, or return the names of the missing settings.
	pub fn build(self) -> Result<SmtpConfig, Vec<&'static str>> {
		let from_address = self.from_address.filter(|a| !a.trim().is_empty());
		let recipients: Vec<String> = self
			.recipients
			.unwrap_or_default()
			.into_iter()
			.map(|r| r.trim().to_string())
			.filter(|r| !r.is_empty())
			.collect();
		let password = self.password.filter(|p| !p.expose().is_empty());

		let mut missing = Vec::new();
		if from_address.is_none() {
			missing.push("sender address");
		}
		if recipients.is_empty() {
			missing.push("recipient");
		}
		if password.is_none() {
			missing.push("password");
		}

		let (Some(from_address), Some(password)) = (from_address, password) else {
			return Err(missing);
		};
		if recipients.is_empty() {
			return Err(missing);
		}

		Ok(SmtpConfig {
			host: self
				.host
				.filter(|h| !h.is_empty())
				.unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
			port: self.port.unwrap_or(DEFAULT_SMTP_PORT),
			username: self.username.unwrap_or_else(|| from_address.clone()),
			password,
			from_name: self.from_name,
			from_address,
			recipients,
			tls_mode: self.tls_mode.unwrap_or_default(),
		})
	}
}

/// Validated mail relay configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
	pub host: String,
	pub port: u16,
	pub username: String,
	pub password: SecretString,
	pub from_address: String,
	pub from_name: Option<String>,
	pub recipients: Vec<String>,
	pub tls_mode: TlsMode,
}
