// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Time and size bounded batching of failure records.

use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
	pub job_id: String,
	pub timestamp: DateTime<Utc>,
	pub description: String,
	pub detailed_log: String,
	pub email_recipients: Option<String>,
	pub custom_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureBatch {
	pub records: Vec<FailureRecord>,
	/// When the first record of this batch was offered.
	pub started_at: Option<DateTime<Utc>>,
}

impl FailureBatch {
	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}
}

/// Owns the pending batch. `started_at` is set iff the batch is non-empty.
#[derive(Debug)]
pub struct FailureAggregator {
	batch: FailureBatch,
	window: chrono::Duration,
	max_size: usize,
}

impl FailureAggregator {
	pub fn new(window: Duration, max_size: usize) -> Self {
		Self {
			batch: FailureBatch::default(),
			window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
			max_size: max_size.max(1),
		}
	}

	pub fn offer(&mut self, record: FailureRecord, now: DateTime<Utc>) {
		if self.batch.records.is_empty() {
			self.batch.started_at = Some(now);
		}
		self.batch.records.push(record);
	}

	pub fn is_full(&self) -> bool {
		self.batch.records.len() >= self.max_size
	}

	pub fn should_flush(&self, now: DateTime<Utc>) -> bool {
		let Some(started_at) = self.batch.started_at else {
			return false;
		};
		self.is_full() || now.signed_duration_since(started_at) >= self.window
	}

	pub fn maybe_flush(&mut self, now: DateTime<Utc>) -> Option<FailureBatch> {
		self.should_flush(now).then(|| self.flush())
	}

	/// Take the pending batch, leaving the aggregator empty.
	pub fn flush(&mut self) -> FailureBatch {
		std::mem::take(&mut self.batch)
	}

	pub fn len(&self) -> usize {
		self.batch.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.batch.records.is_empty()
	}

	pub fn started_at(&self) -> Option<DateTime<Utc>> {
		self.batch.started_at
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration as ChronoDuration;
	use proptest::prelude::*;

	fn record(job_id: &str, at: DateTime<Utc>) -> FailureRecord {
		FailureRecord {
			job_id: job_id.to_string(),
			timestamp: at,
			description: format!("job {job_id} failed"),
			detailed_log: String::new(),
			email_recipients: None,
			custom_text: None,
		}
	}

	#[test]
	fn empty_aggregator_never_flushes() {
		let mut agg = FailureAggregator::new(Duration::from_secs(0), 1);
		assert!(agg.maybe_flush(Utc::now()).is_none());
		assert!(agg.started_at().is_none());
	}

	#[test]
	fn flushes_when_window_elapses() {
		let start = Utc::now();
		let mut agg = FailureAggregator::new(Duration::from_secs(60), 250);
		agg.offer(record("1", start), start);
		agg.offer(record("2", start), start + ChronoDuration::seconds(30));

		assert!(agg.maybe_flush(start + ChronoDuration::seconds(59)).is_none());
		let batch = agg.maybe_flush(start + ChronoDuration::seconds(60)).unwrap();
		assert_eq!(batch.len(), 2);
		assert_eq!(batch.started_at, Some(start));
		assert!(agg.is_empty());
		assert!(agg.started_at().is_none());
	}

	#[test]
	fn flushes_when_full() {
		let now = Utc::now();
		let mut agg = FailureAggregator::new(Duration::from_secs(3600), 2);
		agg.offer(record("1", now), now);
		assert!(!agg.is_full());
		agg.offer(record("2", now), now);
		assert!(agg.is_full());
		assert_eq!(agg.maybe_flush(now).unwrap().len(), 2);
	}

	proptest! {
		#[test]
		fn started_at_is_first_offer_and_flush_returns_everything(
			offsets in proptest::collection::vec(0i64..10_000, 1..40),
		) {
			let base = Utc::now();
			let mut agg = FailureAggregator::new(Duration::from_secs(60), 250);
			let mut expected = Vec::new();
			let mut at = base;
			for (i, offset) in offsets.iter().enumerate() {
				at += ChronoDuration::milliseconds(*offset);
				let r = record(&i.to_string(), at);
				expected.push(r.clone());
				agg.offer(r, at);
				prop_assert_eq!(agg.started_at(), Some(base + ChronoDuration::milliseconds(offsets[0])));
			}

			let batch = agg.flush();
			prop_assert_eq!(batch.records, expected);
			prop_assert!(agg.is_empty());
			prop_assert!(agg.started_at().is_none());
		}
	}
}
