// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Owns the pending failure batch between scheduler cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pgagent_config::AlertsConfig;
use pgagent_db::{AgentStore, StatusChannel};
use pgagent_smtp::MailRelay;
use tracing::{debug, instrument};

use crate::aggregator::{FailureAggregator, FailureBatch};
use crate::composer::AlertComposer;
use crate::listener::NotificationListener;
use crate::transport::{AlertTransport, DeliveryOutcome};

pub struct NotificationPipeline {
	aggregator: FailureAggregator,
	composer: AlertComposer,
	transport: AlertTransport,
	min_check_interval: chrono::Duration,
	last_check: Option<DateTime<Utc>>,
}

impl NotificationPipeline {
	pub fn new(
		aggregator: FailureAggregator,
		composer: AlertComposer,
		transport: AlertTransport,
		min_check_interval: Duration,
	) -> Self {
		Self {
			aggregator,
			composer,
			transport,
			min_check_interval: chrono::Duration::from_std(min_check_interval)
				.unwrap_or(chrono::Duration::zero()),
			last_check: None,
		}
	}

	pub fn from_config(config: &AlertsConfig, relay: Option<Arc<dyn MailRelay>>) -> Self {
		Self::new(
			FailureAggregator::new(config.aggregation_window, config.max_batch_size),
			AlertComposer::from_config(config),
			AlertTransport::new(relay, config),
			config.min_check_interval,
		)
	}

	pub fn aggregator(&self) -> &FailureAggregator {
		&self.aggregator
	}

	/// Route every pending notification, then run the time-based flush
	/// check. Returns how many events were routed.
	#[instrument(skip_all)]
	pub async fn drain<S, C>(
		&mut self,
		listener: &NotificationListener<S>,
		channel: &mut C,
		now: DateTime<Utc>,
	) -> pgagent_db::Result<usize>
	where
		S: AgentStore + ?Sized,
		C: StatusChannel + ?Sized,
	{
		let events = listener.poll(channel).await?;

		for event in &events {
			let decision = listener.route(event, &mut self.aggregator, now).await;
			if decision.queued_for_email && self.aggregator.is_full() {
				let batch = self.aggregator.flush();
				self.deliver(batch, now).await;
			}
		}

		self.tick(now).await;
		Ok(events.len())
	}

	/// Time-based flush check, run at most once per minimum check interval.
	pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<DeliveryOutcome> {
		if let Some(last) = self.last_check {
			if now.signed_duration_since(last) < self.min_check_interval {
				return None;
			}
		}
		self.last_check = Some(now);

		let batch = self.aggregator.maybe_flush(now)?;
		Some(self.deliver(batch, now).await)
	}

	/// Send whatever is pending, regardless of age. Used on shutdown.
	pub async fn flush_now(&mut self, now: DateTime<Utc>) -> Option<DeliveryOutcome> {
		if self.aggregator.is_empty() {
			return None;
		}
		let batch = self.aggregator.flush();
		Some(self.deliver(batch, now).await)
	}

	async fn deliver(&self, batch: FailureBatch, now: DateTime<Utc>) -> DeliveryOutcome {
		debug!(failures = batch.len(), "flushing failure batch");
		let alert = self.composer.compose(&batch, now).await;
		self.transport.send_with_fallback(&alert, batch.len()).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::details::{DetailCollector, HostProbe};
	use crate::test_time;
	use crate::transport::tests::{alerts_config, ScriptedRelay};
	use pgagent_db::testing::MemoryStore;
	use pgagent_db::{JobStatus, JobStatusEvent, NotificationSettingsRow};
	use std::path::Path;

	fn listener(store: Arc<MemoryStore>, dir: &Path) -> NotificationListener<MemoryStore> {
		NotificationListener::new(
			store,
			DetailCollector::new(
				HostProbe {
					meminfo: dir.join("meminfo"),
					loadavg: dir.join("loadavg"),
				},
				dir.join("jobs"),
				dir.join("application.log"),
				50,
			),
		)
	}

	fn email_on(store: &MemoryStore, job_id: &str) {
		store.set_settings(NotificationSettingsRow {
			job_id: job_id.to_string(),
			email: Some(true),
			..Default::default()
		});
	}

	fn publish_failure(store: &MemoryStore, job_id: &str) {
		let event = JobStatusEvent::new(
			job_id,
			JobStatus::Failure,
			format!("job {job_id} failed"),
			test_time("2025-05-05 10:00:00"),
		);
		store.push_raw(&event.to_payload().unwrap());
	}

	fn pipeline(dir: &Path, relay: Option<Arc<dyn MailRelay>>, max_batch: usize) -> NotificationPipeline {
		let config = AlertsConfig {
			max_batch_size: max_batch,
			..alerts_config(dir)
		};
		NotificationPipeline::new(
			FailureAggregator::new(config.aggregation_window, config.max_batch_size),
			AlertComposer::from_config(&config),
			AlertTransport::new(relay, &config).with_base_delay(Duration::from_millis(1)),
			config.min_check_interval,
		)
	}

	fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<std::path::PathBuf> {
		std::fs::read_dir(dir)
			.unwrap()
			.map(|e| e.unwrap().path())
			.filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
			.collect()
	}

	#[tokio::test]
	async fn failed_delivery_of_two_failures_is_archived() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		email_on(&store, "1");
		email_on(&store, "2");
		publish_failure(&store, "1");
		publish_failure(&store, "2");

		let relay = ScriptedRelay::always_failing();
		let mut pipeline = pipeline(dir.path(), Some(relay), 250);
		let listener = listener(store, dir.path());
		let now = test_time("2025-05-05 10:00:00");

		assert_eq!(pipeline.drain(&listener, &mut channel, now).await.unwrap(), 2);
		assert_eq!(pipeline.aggregator().len(), 2);

		let later = now + chrono::Duration::seconds(60);
		let outcome = pipeline.tick(later).await.unwrap();

		let DeliveryOutcome::Archived(path) = outcome else {
			panic!("expected a fallback copy, got {outcome:?}");
		};
		let contents = std::fs::read_to_string(path).unwrap();
		assert!(contents.starts_with("Subject: ALERT: Multiple Job Failures (2)\n\n<!DOCTYPE html>"));
		assert!(contents.contains("<tr><td>1</td>"));
		assert!(contents.contains("<tr><td>2</td>"));
		assert!(pipeline.aggregator().is_empty());
		assert_eq!(files_with_prefix(dir.path(), "job_failures_").len(), 1);
	}

	#[tokio::test]
	async fn full_batch_is_sent_without_waiting_for_the_window() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		for id in ["1", "2", "3"] {
			email_on(&store, id);
			publish_failure(&store, id);
		}

		let relay = Arc::new(ScriptedRelay::default());
		let mut pipeline = pipeline(dir.path(), Some(relay.clone()), 2);
		let listener = listener(store, dir.path());

		pipeline
			.drain(&listener, &mut channel, test_time("2025-05-05 10:00:00"))
			.await
			.unwrap();

		let delivered = relay.delivered.lock().unwrap();
		assert_eq!(delivered.len(), 1);
		assert_eq!(delivered[0].subject, "ALERT: Multiple Job Failures (2)");
		assert_eq!(pipeline.aggregator().len(), 1);
	}

	#[tokio::test]
	async fn back_to_back_batches_keep_separate_reports() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		for id in ["1", "2"] {
			email_on(&store, id);
			publish_failure(&store, id);
		}

		let mut pipeline = pipeline(dir.path(), Some(ScriptedRelay::always_failing()), 1);
		let listener = listener(store, dir.path());

		pipeline
			.drain(&listener, &mut channel, test_time("2025-05-05 10:00:00"))
			.await
			.unwrap();

		let mut reports: Vec<String> = files_with_prefix(dir.path(), "job_failures_")
			.into_iter()
			.map(|p| std::fs::read_to_string(p).unwrap())
			.collect();
		reports.sort();
		assert_eq!(reports.len(), 2);
		assert!(reports[0].contains("Job ID: 1") && !reports[0].contains("Job ID: 2"));
		assert!(reports[1].contains("Job ID: 2") && !reports[1].contains("Job ID: 1"));
		assert_eq!(files_with_prefix(dir.path(), "failed_email_").len(), 2);
	}

	#[tokio::test]
	async fn time_checks_are_rate_limited() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		email_on(&store, "1");
		publish_failure(&store, "1");

		let relay = Arc::new(ScriptedRelay::default());
		let mut pipeline = pipeline(dir.path(), Some(relay.clone()), 250);
		let listener = listener(store, dir.path());
		let start = test_time("2025-05-05 10:00:00");

		pipeline.drain(&listener, &mut channel, start).await.unwrap();

		let at_window = start + chrono::Duration::seconds(58);
		assert!(pipeline.tick(at_window).await.is_none());
		// Window has elapsed but the last check was less than 5s ago.
		let just_after = start + chrono::Duration::seconds(60);
		assert!(pipeline.tick(just_after).await.is_none());
		assert_eq!(pipeline.aggregator().len(), 1);

		let next_check = at_window + chrono::Duration::seconds(5);
		assert_eq!(pipeline.tick(next_check).await, Some(DeliveryOutcome::Sent));
		assert!(pipeline.aggregator().is_empty());
		assert_eq!(relay.calls(), 1);
	}

	#[tokio::test]
	async fn flush_now_sends_pending_failures_once() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::new();
		let mut channel = store.channel();
		email_on(&store, "4");
		publish_failure(&store, "4");

		let relay = Arc::new(ScriptedRelay::default());
		let mut pipeline = pipeline(dir.path(), Some(relay.clone()), 250);
		let listener = listener(store, dir.path());
		let now = test_time("2025-05-05 10:00:00");
		pipeline.drain(&listener, &mut channel, now).await.unwrap();

		assert_eq!(pipeline.flush_now(now).await, Some(DeliveryOutcome::Sent));
		assert_eq!(pipeline.flush_now(now).await, None);
		let delivered = relay.delivered.lock().unwrap();
		assert_eq!(delivered[0].subject, "ALERT: Job Failure Detected");
		assert!(delivered[0].attachment.is_some());
	}
}
