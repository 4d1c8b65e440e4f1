// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-job notification policy.
//!
//! Settings are read fresh for every event. A missing row, an unreadable row
//! or a failed lookup all fall back to [`NotificationSettings::defaults`]:
//! enabled, browser on, email off, notify on failure, no debounce.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pgagent_db::{parse_timestamp, AgentStore, JobStatus, NotificationSettingsRow};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyWhen {
	All,
	SuccessOnly,
	#[default]
	FailureOnly,
	Both,
}

impl NotifyWhen {
	/// Catalog codes: `a`, `s`, `f`, `b`.
	pub fn from_code(code: &str) -> Option<Self> {
		match code.trim() {
			"a" => Some(NotifyWhen::All),
			"s" => Some(NotifyWhen::SuccessOnly),
			"f" => Some(NotifyWhen::FailureOnly),
			"b" => Some(NotifyWhen::Both),
			_ => None,
		}
	}

	pub fn matches(&self, status: &JobStatus) -> bool {
		match self {
			NotifyWhen::All => true,
			NotifyWhen::SuccessOnly => matches!(status, JobStatus::Success),
			NotifyWhen::FailureOnly => matches!(status, JobStatus::Failure),
			NotifyWhen::Both => matches!(status, JobStatus::Success | JobStatus::Failure),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSettings {
	pub job_id: String,
	pub enabled: bool,
	pub browser_enabled: bool,
	pub email_enabled: bool,
	pub when: NotifyWhen,
	/// Minimum seconds between two notifications; 0 disables debouncing.
	pub min_interval_secs: u64,
	/// Comma-separated override of the default recipients.
	pub email_recipients: Option<String>,
	pub custom_text: Option<String>,
	pub last_notification_at: Option<DateTime<Utc>>,
}

impl NotificationSettings {
	pub fn defaults(job_id: impl Into<String>) -> Self {
		Self {
			job_id: job_id.into(),
			enabled: true,
			browser_enabled: true,
			email_enabled: false,
			when: NotifyWhen::FailureOnly,
			min_interval_secs: 0,
			email_recipients: None,
			custom_text: None,
			last_notification_at: None,
		}
	}

	/// Interpret a catalog row. Unreadable fields are logged and replaced by
	/// their defaults; the rest of the row is still used.
	pub fn from_row(row: NotificationSettingsRow) -> Self {
		let defaults = Self::defaults(row.job_id.clone());

		let when = match row.when.as_deref() {
			None => defaults.when,
			Some(code) => NotifyWhen::from_code(code).unwrap_or_else(|| {
				warn!(job_id = %row.job_id, when = code, "unknown notification condition, using failure-only");
				defaults.when
			}),
		};

		let min_interval_secs = match row.min_interval.as_deref().map(str::trim) {
			None | Some("") => 0,
			Some(raw) => match raw.parse::<i64>() {
				Ok(secs) => secs.max(0) as u64,
				Err(_) => {
					warn!(job_id = %row.job_id, min_interval = raw, "ignoring non-numeric notification interval");
					0
				}
			},
		};

		let last_notification_at = match row.last_notification.as_deref() {
			None | Some("") => None,
			Some(raw) => {
				let parsed = parse_timestamp(raw);
				if parsed.is_none() {
					warn!(job_id = %row.job_id, last_notification = raw, "ignoring unreadable last notification time");
				}
				parsed
			}
		};

		Self {
			enabled: row.enabled.unwrap_or(defaults.enabled),
			browser_enabled: row.browser.unwrap_or(defaults.browser_enabled),
			email_enabled: row.email.unwrap_or(defaults.email_enabled),
			when,
			min_interval_secs,
			email_recipients: row.email_recipients.filter(|r| !r.trim().is_empty()),
			custom_text: row.custom_text.filter(|t| !t.is_empty()),
			last_notification_at,
			job_id: row.job_id,
		}
	}
}

/// Condition match first, then the debounce window. Debouncing only ever
/// turns a `true` into `false`.
pub fn should_notify(settings: &NotificationSettings, status: &JobStatus, now: DateTime<Utc>) -> bool {
	if !settings.enabled || !settings.when.matches(status) {
		return false;
	}

	if settings.min_interval_secs == 0 {
		return true;
	}

	match settings.last_notification_at {
		None => true,
		Some(last) => {
			let elapsed = now.signed_duration_since(last).num_seconds();
			elapsed >= settings.min_interval_secs as i64
		}
	}
}

pub struct PolicyEngine<S: AgentStore + ?Sized> {
	store: Arc<S>,
}

impl<S: AgentStore + ?Sized> PolicyEngine<S> {
	pub fn new(store: Arc<S>) -> Self {
		Self { store }
	}

	/// Never fails; lookup problems yield the defaults.
	pub async fn load_settings(&self, job_id: &str) -> NotificationSettings {
		match self.store.notification_settings(job_id).await {
			Ok(Some(row)) => NotificationSettings::from_row(row),
			Ok(None) => {
				debug!(job_id, "no notification settings, using defaults");
				NotificationSettings::defaults(job_id)
			}
			Err(e) => {
				warn!(job_id, error = %e, "failed to load notification settings, using defaults");
				NotificationSettings::defaults(job_id)
			}
		}
	}

	/// Stamp the debounce clock. Failures are logged only.
	pub async fn record_notified(&self, job_id: &str, now: DateTime<Utc>) {
		if let Err(e) = self.store.touch_last_notification(job_id, now).await {
			warn!(job_id, error = %e, "failed to record notification time");
		}
	}
}
