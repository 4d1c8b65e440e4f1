// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Alert delivery with bounded retries and a local fallback copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pgagent_config::AlertsConfig;
use pgagent_db::FILE_TIMESTAMP_FORMAT;
use pgagent_smtp::{AlertEmail, MailRelay, SmtpError};
use tracing::{error, info, instrument, warn};

use crate::composer::OutboundAlert;
use crate::files::create_unique;

const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const RETRY_FACTOR: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	Sent,
	/// Delivery failed; the alert was written here instead.
	Archived(PathBuf),
	/// Delivery failed and the fallback copy could not be written either.
	Lost,
}

pub struct AlertTransport {
	relay: Option<Arc<dyn MailRelay>>,
	fallback_dir: PathBuf,
	max_attempts: u32,
	send_timeout: Duration,
	base_delay: Duration,
}

impl AlertTransport {
	/// `relay` is `None` when the relay configuration is incomplete; every
	/// send then goes straight to the fallback directory.
	pub fn new(relay: Option<Arc<dyn MailRelay>>, config: &AlertsConfig) -> Self {
		Self {
			relay,
			fallback_dir: config.fallback_dir.clone(),
			max_attempts: config.max_send_attempts.max(1),
			send_timeout: config.send_timeout,
			base_delay: BASE_RETRY_DELAY,
		}
	}

	pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
		self.base_delay = base_delay;
		self
	}

	/// Submit the alert. Never fails outward; `false` means not delivered.
	#[instrument(skip(self, alert), fields(subject = %alert.subject))]
	pub async fn send(&self, alert: &OutboundAlert) -> bool {
		let Some(relay) = &self.relay else {
			error!("mail relay is not configured (sender, recipient or password missing); alert not sent");
			return false;
		};

		let email = AlertEmail {
			subject: alert.subject.clone(),
			body_html: alert.body_html.clone(),
			attachment: alert.artifact.clone(),
			recipients: alert.recipients.clone(),
		};

		let mut attempt = 1u32;
		loop {
			let result = match tokio::time::timeout(self.send_timeout, relay.deliver(&email)).await {
				Ok(result) => result,
				Err(_) => Err(SmtpError::Connection(format!(
					"timed out after {}s",
					self.send_timeout.as_secs()
				))),
			};

			match result {
				Ok(()) => return true,
				Err(e) if e.is_transient() && attempt < self.max_attempts => {
					let delay = calculate_backoff_delay(attempt, self.base_delay);
					warn!(
						attempt,
						max_attempts = self.max_attempts,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"alert delivery failed, retrying"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				Err(e) => {
					error!(attempt, error = %e, "alert delivery failed");
					return false;
				}
			}
		}
	}

	/// Deliver or archive. Terminal for the batch either way.
	pub async fn send_with_fallback(&self, alert: &OutboundAlert, batch_len: usize) -> DeliveryOutcome {
		if self.send(alert).await {
			info!(failures = batch_len, "failure alert sent");
			return DeliveryOutcome::Sent;
		}

		match write_fallback(&self.fallback_dir, alert).await {
			Ok(path) => {
				warn!(
					failures = batch_len,
					path = %path.display(),
					"failure alert could not be sent, saved locally"
				);
				DeliveryOutcome::Archived(path)
			}
			Err(e) => {
				error!(
					failures = batch_len,
					dir = %self.fallback_dir.display(),
					error = %e,
					"failure alert could not be sent or saved"
				);
				DeliveryOutcome::Lost
			}
		}
	}
}

/// Delay before retry number `retry` (1-based): base doubling, capped.
pub(crate) fn calculate_backoff_delay(retry: u32, base: Duration) -> Duration {
	let factor = RETRY_FACTOR.saturating_pow(retry.saturating_sub(1));
	base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

async fn write_fallback(dir: &Path, alert: &OutboundAlert) -> std::io::Result<PathBuf> {
	let stamp = Utc::now().format(FILE_TIMESTAMP_FORMAT).to_string();
	let contents = format!("Subject: {}\n\n{}", alert.subject, alert.body_html);
	create_unique(dir, "failed_email", &stamp, "html", contents.as_bytes()).await
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::collections::VecDeque;
	use std::sync::Mutex;

	/// Relay that answers from a script; an empty script means success.
	#[derive(Default)]
	pub(crate) struct ScriptedRelay {
		script: Mutex<VecDeque<Result<(), SmtpError>>>,
		pub(crate) delivered: Mutex<Vec<AlertEmail>>,
		pub(crate) calls: Mutex<u32>,
	}

	impl ScriptedRelay {
		pub(crate) fn failing_with(errors: Vec<SmtpError>) -> Arc<Self> {
			Arc::new(Self {
				script: Mutex::new(errors.into_iter().map(Err).collect()),
				..Default::default()
			})
		}

		pub(crate) fn always_failing() -> Arc<Self> {
			Self::failing_with((0..16).map(|_| SmtpError::Send("relay down".into())).collect())
		}

		pub(crate) fn calls(&self) -> u32 {
			*self.calls.lock().unwrap()
		}
	}

	#[async_trait]
	impl MailRelay for ScriptedRelay {
		async fn deliver(&self, email: &AlertEmail) -> Result<(), SmtpError> {
			*self.calls.lock().unwrap() += 1;
			let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
			if next.is_ok() {
				self.delivered.lock().unwrap().push(email.clone());
			}
			next
		}
	}

	pub(crate) fn alerts_config(dir: &Path) -> AlertsConfig {
		AlertsConfig {
			fallback_dir: dir.to_path_buf(),
			artifact_dir: dir.to_path_buf(),
			..AlertsConfig::default()
		}
	}

	fn alert() -> OutboundAlert {
		OutboundAlert {
			subject: "ALERT: Multiple Job Failures (2)".to_string(),
			body_html: "<html><body>two failures</body></html>".to_string(),
			artifact: None,
			recipients: Some(vec!["ops@example.com".to_string()]),
		}
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let base = Duration::from_secs(1);
		assert_eq!(calculate_backoff_delay(1, base), Duration::from_secs(1));
		assert_eq!(calculate_backoff_delay(2, base), Duration::from_secs(2));
		assert_eq!(calculate_backoff_delay(3, base), Duration::from_secs(4));
		assert_eq!(calculate_backoff_delay(10, base), MAX_RETRY_DELAY);
		assert_eq!(calculate_backoff_delay(100, base), MAX_RETRY_DELAY);
	}

	#[tokio::test(start_paused = true)]
	async fn transient_errors_are_retried() {
		let dir = tempfile::tempdir().unwrap();
		let relay = ScriptedRelay::failing_with(vec![
			SmtpError::Connection("refused".into()),
			SmtpError::Send("421".into()),
		]);
		let transport = AlertTransport::new(Some(relay.clone()), &alerts_config(dir.path()));

		assert!(transport.send(&alert()).await);
		assert_eq!(relay.calls(), 3);
		let delivered = relay.delivered.lock().unwrap();
		assert_eq!(delivered[0].recipients, Some(vec!["ops@example.com".to_string()]));
	}

	#[tokio::test(start_paused = true)]
	async fn permanent_errors_are_not_retried() {
		let dir = tempfile::tempdir().unwrap();
		let relay = ScriptedRelay::failing_with(vec![SmtpError::Address("nobody".into())]);
		let transport = AlertTransport::new(Some(relay.clone()), &alerts_config(dir.path()));

		assert!(!transport.send(&alert()).await);
		assert_eq!(relay.calls(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn relay_failure_writes_fallback_copy() {
		let dir = tempfile::tempdir().unwrap();
		let relay = ScriptedRelay::always_failing();
		let transport = AlertTransport::new(Some(relay.clone()), &alerts_config(dir.path()));

		let outcome = transport.send_with_fallback(&alert(), 2).await;

		let DeliveryOutcome::Archived(path) = outcome else {
			panic!("expected a fallback copy, got {outcome:?}");
		};
		assert_eq!(relay.calls(), 3);
		let name = path.file_name().unwrap().to_string_lossy().into_owned();
		assert!(name.starts_with("failed_email_") && name.ends_with(".html"));
		let contents = std::fs::read_to_string(&path).unwrap();
		assert_eq!(
			contents,
			"Subject: ALERT: Multiple Job Failures (2)\n\n<html><body>two failures</body></html>"
		);
	}

	#[tokio::test]
	async fn missing_relay_goes_straight_to_fallback() {
		let dir = tempfile::tempdir().unwrap();
		let transport = AlertTransport::new(None, &alerts_config(dir.path()));

		assert!(matches!(
			transport.send_with_fallback(&alert(), 1).await,
			DeliveryOutcome::Archived(_)
		));
	}

	#[tokio::test]
	async fn fallback_files_do_not_overwrite_each_other() {
		let dir = tempfile::tempdir().unwrap();
		let a = write_fallback(dir.path(), &alert()).await.unwrap();
		let b = write_fallback(dir.path(), &alert()).await.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn unwritable_fallback_dir_loses_the_alert() {
		let dir = tempfile::tempdir().unwrap();
		let transport = AlertTransport::new(None, &alerts_config(&dir.path().join("missing")));

		assert_eq!(transport.send_with_fallback(&alert(), 1).await, DeliveryOutcome::Lost);
	}

	#[tokio::test(start_paused = true)]
	async fn slow_relay_attempts_time_out() {
		struct Stalled;

		#[async_trait]
		impl MailRelay for Stalled {
			async fn deliver(&self, _email: &AlertEmail) -> Result<(), SmtpError> {
				tokio::time::sleep(Duration::from_secs(3600)).await;
				Ok(())
			}
		}

		let dir = tempfile::tempdir().unwrap();
		let transport = AlertTransport::new(Some(Arc::new(Stalled)), &alerts_config(dir.path()));
		assert!(!transport.send(&alert()).await);
	}
}
