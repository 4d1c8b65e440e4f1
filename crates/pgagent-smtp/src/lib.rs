// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SMTP relay client for failure alerts.
//!
//! Alerts go out as `multipart/mixed`: an HTML body plus, when the report file
//! exists, the report as a `text/plain` attachment. [`MailRelay`] is the seam
//! the alert transport talks to; [`SmtpClient`] is the [`lettre`] backed
//! implementation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
	message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
	transport::smtp::authentication::Credentials,
	AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use pgagent_config::{SmtpConfig, TlsMode};

#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
	#[error("connection failed: {0}")]
	Connection(String),

	#[error("send failed: {0}")]
	Send(String),

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("invalid email address: {0}")]
	Address(String),
}

impl SmtpError {
	/// Whether another attempt could succeed.
	pub fn is_transient(&self) -> bool {
		matches!(self, SmtpError::Connection(_) | SmtpError::Send(_))
	}
}

/// One outgoing alert.
#[derive(Debug, Clone, Default)]
pub struct AlertEmail {
	pub subject: String,
	pub body_html: String,
	/// Report attached as `text/plain` if the file exists at send time.
	pub attachment: Option<PathBuf>,
	/// Replaces the configured recipients for this message only.
	pub recipients: Option<Vec<String>>,
}

#[async_trait]
pub trait MailRelay: Send + Sync {
	async fn deliver(&self, email: &AlertEmail) -> Result<(), SmtpError>;
}

pub struct SmtpClient {
	transport: AsyncSmtpTransport<Tokio1Executor>,
	from_mailbox: Mailbox,
	default_recipients: Vec<Mailbox>,
}

impl SmtpClient {
	/// Build the relay transport. No connection is made until the first send.
	///
	/// `timeout` bounds each SMTP command exchange.
	#[tracing::instrument(
		name = "smtp_client_new",
		skip(config),
		fields(host = %config.host, port = config.port, tls = ?config.tls_mode)
	)]
	pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, SmtpError> {
		let from = match &config.from_name {
			Some(name) => format!("{name} <{}>", config.from_address),
			None => config.from_address.clone(),
		};
		let from_mailbox: Mailbox = from
			.parse()
			.map_err(|e| SmtpError::Address(format!("{from}: {e}")))?;

		let default_recipients = parse_mailboxes(&config.recipients)?;
		if default_recipients.is_empty() {
			return Err(SmtpError::Config("no recipients configured".into()));
		}

		let builder = match config.tls_mode {
			TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
				.map_err(|e| SmtpError::Connection(format!("{e}")))?,
			TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
				.map_err(|e| SmtpError::Connection(format!("{e}")))?,
			TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
		};

		let credentials = Credentials::new(
			config.username.clone(),
			config.password.expose().clone(),
		);
		let transport = builder
			.port(config.port)
			.timeout(Some(timeout))
			.credentials(credentials)
			.build();

		tracing::debug!("SMTP client initialized");

		Ok(Self {
			transport,
			from_mailbox,
			default_recipients,
		})
	}

	async fn build_message(&self, email: &AlertEmail) -> Result<Message, SmtpError> {
		let overrides: Vec<String> = email
			.recipients
			.iter()
			.flatten()
			.filter(|address| {
				let valid = is_valid_email(address);
				if !valid {
					tracing::warn!(address = %address, "skipping invalid recipient");
				}
				valid
			})
			.cloned()
			.collect();
		let recipients = if overrides.is_empty() {
			self.default_recipients.clone()
		} else {
			parse_mailboxes(&overrides)?
		};

		let mut builder = Message::builder()
			.from(self.from_mailbox.clone())
			.subject(email.subject.as_str());
		for mailbox in recipients {
			builder = builder.to(mailbox);
		}

		let mut body = MultiPart::mixed().singlepart(
			SinglePart::builder()
				.header(ContentType::TEXT_HTML)
				.body(email.body_html.clone()),
		);

		if let Some(path) = &email.attachment {
			match tokio::fs::read(path).await {
				Ok(content) => {
					let filename = path
						.file_name()
						.map(|n| n.to_string_lossy().into_owned())
						.unwrap_or_else(|| "job_failures_report.log".to_string());
					body = body.singlepart(
						Attachment::new(filename).body(content, ContentType::TEXT_PLAIN),
					);
				}
				Err(e) => {
					tracing::warn!(path = %path.display(), error = %e, "report not attached");
				}
			}
		}

		builder
			.multipart(body)
			.map_err(|e| SmtpError::Send(format!("failed to build message: {e}")))
	}
}

#[async_trait]
impl MailRelay for SmtpClient {
	#[tracing::instrument(name = "smtp_deliver", skip(self, email), fields(subject = %email.subject))]
	async fn deliver(&self, email: &AlertEmail) -> Result<(), SmtpError> {
		let message = self.build_message(email).await?;

		self
			.transport
			.send(message)
			.await
			.map_err(|e| SmtpError::Send(format!("{e}")))?;

		tracing::debug!("alert accepted by relay");
		Ok(())
	}
}

fn parse_mailboxes(addresses: &[String]) -> Result<Vec<Mailbox>, SmtpError> {
	addresses
		.iter()
		.map(|a| {
			a.parse::<Mailbox>()
				.map_err(|e| SmtpError::Address(format!("{a}: {e}")))
		})
		.collect()
}

/// Split a comma-separated recipient list: entries are trimmed, empties
/// dropped and duplicates removed keeping first occurrence order.
pub fn parse_recipients(list: &str) -> Vec<String> {
	let mut recipients: Vec<String> = Vec::new();
	for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
		if !recipients.iter().any(|r| r.eq_ignore_ascii_case(entry)) {
			recipients.push(entry.to_string());
		}
	}
	recipients
}

pub fn is_valid_email(email: &str) -> bool {
	email.parse::<Mailbox>().is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use pgagent_config::Secret;
	use std::io::Write;

	fn config() -> SmtpConfig {
		SmtpConfig {
			host: "smtp.example.com".to_string(),
			port: 587,
			username: "agent@example.com".to_string(),
			password: Secret::new("app-password".to_string()),
			from_address: "agent@example.com".to_string(),
			from_name: Some("pgAgent".to_string()),
			recipients: vec!["dba@example.com".to_string()],
			tls_mode: TlsMode::StartTls,
		}
	}

	fn rendered(message: &Message) -> String {
		String::from_utf8_lossy(&message.formatted()).into_owned()
	}

	#[test]
	fn recipients_are_trimmed_and_deduplicated() {
		assert_eq!(
			parse_recipients(" a@x.org ,b@x.org,, A@x.org ,c@x.org"),
			vec!["a@x.org", "b@x.org", "c@x.org"]
		);
		assert!(parse_recipients(" , ").is_empty());
	}

	#[test]
	fn rejects_invalid_sender() {
		let config = SmtpConfig {
			from_address: "not-an-address".to_string(),
			from_name: None,
			..config()
		};
		assert!(matches!(
			SmtpClient::new(&config, Duration::from_secs(5)),
			Err(SmtpError::Address(_))
		));
	}

	#[test]
	fn transient_errors_are_classified() {
		assert!(SmtpError::Send("421".into()).is_transient());
		assert!(SmtpError::Connection("refused".into()).is_transient());
		assert!(!SmtpError::Address("x".into()).is_transient());
	}

	#[tokio::test]
	async fn message_uses_default_recipients_and_attaches_report() {
		let client = SmtpClient::new(&config(), Duration::from_secs(5)).unwrap();
		let mut report = tempfile::NamedTempFile::new().unwrap();
		writeln!(report, "JOB FAILURE REPORT").unwrap();

		let email = AlertEmail {
			subject: "ALERT: Job Failure Detected".to_string(),
			body_html: "<html><body>failed</body></html>".to_string(),
			attachment: Some(report.path().to_path_buf()),
			recipients: None,
		};
		let text = rendered(&client.build_message(&email).await.unwrap());

		assert!(text.contains("To: dba@example.com"));
		assert!(text.contains("Subject: ALERT: Job Failure Detected"));
		assert!(text.contains("multipart/mixed"));
		assert!(text.contains("Content-Disposition: attachment"));
	}

	#[tokio::test]
	async fn override_replaces_default_recipients() {
		let client = SmtpClient::new(&config(), Duration::from_secs(5)).unwrap();
		let email = AlertEmail {
			subject: "s".to_string(),
			body_html: "b".to_string(),
			attachment: Some(PathBuf::from("/nonexistent/job_failures.log")),
			recipients: Some(vec!["owner@example.com".to_string()]),
		};
		let text = rendered(&client.build_message(&email).await.unwrap());

		assert!(text.contains("owner@example.com"));
		assert!(!text.contains("dba@example.com"));
		assert!(!text.contains("Content-Disposition: attachment"));
	}

	#[tokio::test]
	async fn invalid_override_addresses_are_skipped() {
		let client = SmtpClient::new(&config(), Duration::from_secs(5)).unwrap();
		let mut email = AlertEmail {
			subject: "s".to_string(),
			body_html: "b".to_string(),
			attachment: None,
			recipients: Some(vec!["not an address".to_string(), "owner@example.com".to_string()]),
		};
		let text = rendered(&client.build_message(&email).await.unwrap());
		assert!(text.contains("owner@example.com"));
		assert!(!text.contains("dba@example.com"));

		email.recipients = Some(vec!["still not an address".to_string()]);
		let text = rendered(&client.build_message(&email).await.unwrap());
		assert!(text.contains("dba@example.com"));
	}

	mod property_tests {
		use super::*;
		use proptest::prelude::*;

		proptest! {
			#[test]
			fn parsed_recipients_are_unique_and_trimmed(
				entries in proptest::collection::vec("[a-z]{1,8}@[a-z]{1,8}\\.org", 0..8),
				pad in " {0,3}",
			) {
				let joined = entries
					.iter()
					.map(|e| format!("{pad}{e}{pad}"))
					.collect::<Vec<_>>()
					.join(",");
				let parsed = parse_recipients(&joined);

				for r in &parsed {
					prop_assert_eq!(r.trim(), r.as_str());
					prop_assert!(is_valid_email(r));
				}
				let mut deduped = parsed.clone();
				deduped.sort();
				deduped.dedup();
				prop_assert_eq!(deduped.len(), parsed.len());
			}
		}
	}
}
