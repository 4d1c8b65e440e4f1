// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pgagent_db::{AgentStore, JobStatusEvent, StatusChannel};
use tracing::{debug, instrument, warn};

use crate::aggregator::{FailureAggregator, FailureRecord};
use crate::details::DetailCollector;
use crate::policy::{should_notify, PolicyEngine};

/// What routing did with one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteDecision {
	pub notified: bool,
	pub queued_for_email: bool,
}

pub struct NotificationListener<S: AgentStore + ?Sized> {
	store: Arc<S>,
	policy: PolicyEngine<S>,
	collector: DetailCollector,
}

impl<S: AgentStore + ?Sized> NotificationListener<S> {
	pub fn new(store: Arc<S>, collector: DetailCollector) -> Self {
		Self {
			policy: PolicyEngine::new(Arc::clone(&store)),
			store,
			collector,
		}
	}

	/// Decode every pending notification. Malformed payloads are skipped.
	pub async fn poll<C>(&self, channel: &mut C) -> pgagent_db::Result<Vec<JobStatusEvent>>
	where
		C: StatusChannel + ?Sized,
	{
		let received_at = Utc::now();
		let payloads = channel.drain().await?;

		let events = payloads
			.iter()
			.filter_map(|payload| match JobStatusEvent::from_payload(payload, received_at) {
				Ok(event) => Some(event),
				Err(e) => {
					warn!(error = %e, payload = %payload, "skipping malformed status notification");
					None
				}
			})
			.collect::<Vec<_>>();

		if !events.is_empty() {
			debug!(count = events.len(), "received status notifications");
		}
		Ok(events)
	}

	#[instrument(skip(self, event, aggregator), fields(job_id = %event.job_id, status = %event.status))]
	pub async fn route(
		&self,
		event: &JobStatusEvent,
		aggregator: &mut FailureAggregator,
		now: DateTime<Utc>,
	) -> RouteDecision {
		if let Err(e) = self.store.record_status(event).await {
			warn!(error = %e, "failed to record job status");
		}

		let settings = self.policy.load_settings(&event.job_id).await;
		if !should_notify(&settings, &event.status, now) {
			debug!("notification suppressed by policy");
			return RouteDecision::default();
		}
		self.policy.record_notified(&event.job_id, now).await;

		let email_requested = event.channels.map_or(true, |c| c.email);
		if !event.status.is_failure() || !settings.email_enabled || !email_requested {
			return RouteDecision {
				notified: true,
				queued_for_email: false,
			};
		}

		let detailed_log = self.collector.collect(&event.job_id).await;
		aggregator.offer(
			FailureRecord {
				job_id: event.job_id.clone(),
				timestamp: event.timestamp,
				description: event.description.clone(),
				detailed_log,
				email_recipients: settings.email_recipients,
				custom_text: settings.custom_text.or_else(|| event.custom_text.clone()),
			},
			now,
		);
		debug!(pending = aggregator.len(), "failure queued for alert");

		RouteDecision {
			notified: true,
			queued_for_email: true,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::details::HostProbe;
	use crate::test_time;
	use pgagent_db::testing::MemoryStore;
	use pgagent_db::{ChannelFlags, DbError, JobStatus, NotificationSettingsRow};
	use std::time::Duration;

	fn listener(store: Arc<MemoryStore>, dir: &std::path::Path) -> NotificationListener<MemoryStore> {
		let collector = DetailCollector::new(
			HostProbe {
				meminfo: dir.join("meminfo"),
				loadavg: dir.join("loadavg"),
			},
			dir.join("jobs"),
			dir.join("application.log"),
			50,
		);
		NotificationListener::new(store, collector)
	}

	fn email_on(job_id: &str) -> NotificationSettingsRow {
		NotificationSettingsRow {
			job_id: job_id.to_string(),
			email: Some(true),
			email_recipients: Some("dba@example.com".to_string()),
			custom_text: Some("check the nightly load".to_string()),
			..Default::default()
		}
	}

	fn aggregator() -> FailureAggregator {
		FailureAggregator::new(Duration::from_secs(60), 250)
	}

	#[tokio::test]
	async fn poll_skips_malformed_payloads() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		store.push_raw("not json");
		store.push_raw(r#"{"status":"f"}"#);
		store.push_raw(r#"{"job_id":12,"status":"f","description":"boom","timestamp":"2025-05-05 10:00:00"}"#);

		let events = listener(store, dir.path()).poll(&mut channel).await.unwrap();

		assert_eq!(events.len(), 1);
		assert_eq!(events[0].job_id, "12");
		assert_eq!(events[0].status, JobStatus::Failure);
	}

	#[tokio::test]
	async fn poll_reports_lost_connection() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		channel.lose_connection();

		let result = listener(store, dir.path()).poll(&mut channel).await;
		assert!(matches!(result, Err(DbError::ConnectionLost)));
	}

	#[tokio::test]
	async fn events_received_before_a_drop_are_still_delivered() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		store.push_raw(r#"{"job_id":"5","status":"f","description":"boom"}"#);
		store.push_raw(r#"{"job_id":"6","status":"s"}"#);
		channel.lose_connection_after(1);
		let listener = listener(store, dir.path());

		let events = listener.poll(&mut channel).await.unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].job_id, "5");

		let result = listener.poll(&mut channel).await;
		assert!(matches!(result, Err(DbError::ConnectionLost)));
	}

	#[tokio::test]
	async fn failure_with_email_enabled_is_queued() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		store.set_settings(email_on("7"));
		let now = test_time("2025-05-05 10:00:00");
		let event = JobStatusEvent::new("7", JobStatus::Failure, "step 2 failed", now);
		let mut agg = aggregator();

		let decision = listener(store.clone(), dir.path()).route(&event, &mut agg, now).await;

		assert_eq!(
			decision,
			RouteDecision {
				notified: true,
				queued_for_email: true
			}
		);
		let batch = agg.flush();
		assert_eq!(batch.records[0].email_recipients.as_deref(), Some("dba@example.com"));
		assert_eq!(batch.records[0].custom_text.as_deref(), Some("check the nightly load"));
		assert!(batch.records[0].detailed_log.contains("System Information:"));
		assert_eq!(store.touched(), vec![("7".to_string(), now)]);
		assert_eq!(store.status_of("7").unwrap().status, JobStatus::Failure);
	}

	#[tokio::test]
	async fn defaults_notify_without_email() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let now = test_time("2025-05-05 10:00:00");
		let event = JobStatusEvent::new("99", JobStatus::Failure, "boom", now);
		let mut agg = aggregator();

		let decision = listener(store.clone(), dir.path()).route(&event, &mut agg, now).await;

		assert!(decision.notified);
		assert!(!decision.queued_for_email);
		assert!(agg.is_empty());
	}

	#[tokio::test]
	async fn success_is_recorded_but_not_notified_by_default() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let now = test_time("2025-05-05 10:00:00");
		let event = JobStatusEvent::new("3", JobStatus::Success, "ok", now);
		let mut agg = aggregator();

		let decision = listener(store.clone(), dir.path()).route(&event, &mut agg, now).await;

		assert_eq!(decision, RouteDecision::default());
		assert!(store.touched().is_empty());
		assert_eq!(store.status_of("3").unwrap().status, JobStatus::Success);
	}

	#[tokio::test]
	async fn payload_can_opt_out_of_email() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		store.set_settings(email_on("7"));
		let now = test_time("2025-05-05 10:00:00");
		let mut event = JobStatusEvent::new("7", JobStatus::Failure, "boom", now);
		event.channels = Some(ChannelFlags {
			browser: true,
			email: false,
		});
		let mut agg = aggregator();

		let decision = listener(store, dir.path()).route(&event, &mut agg, now).await;

		assert!(decision.notified);
		assert!(agg.is_empty());
	}

	#[tokio::test]
	async fn event_custom_text_is_used_when_settings_have_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		store.set_settings(NotificationSettingsRow {
			job_id: "8".to_string(),
			email: Some(true),
			..Default::default()
		});
		let now = test_time("2025-05-05 10:00:00");
		let mut event = JobStatusEvent::new("8", JobStatus::Failure, "boom", now);
		event.custom_text = Some("from the job".to_string());
		let mut agg = aggregator();

		listener(store, dir.path()).route(&event, &mut agg, now).await;

		assert_eq!(agg.flush().records[0].custom_text.as_deref(), Some("from the job"));
	}

	#[tokio::test]
	async fn second_failure_within_interval_is_debounced() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		store.set_settings(NotificationSettingsRow {
			min_interval: Some("300".to_string()),
			..email_on("5")
		});
		let now = test_time("2025-05-05 10:00:00");
		let listener = listener(store.clone(), dir.path());
		let mut agg = aggregator();

		let first = JobStatusEvent::new("5", JobStatus::Failure, "one", now);
		let later = now + chrono::Duration::seconds(30);
		let second = JobStatusEvent::new("5", JobStatus::Failure, "two", later);

		assert!(listener.route(&first, &mut agg, now).await.notified);
		assert!(!listener.route(&second, &mut agg, later).await.notified);
		assert_eq!(agg.len(), 1);
		assert_eq!(store.status_of("5").unwrap().description, "two");
	}
}
