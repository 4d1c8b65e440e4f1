// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns a failure batch into a report file and an HTML alert.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use pgagent_config::AlertsConfig;
use pgagent_db::{FILE_TIMESTAMP_FORMAT, TIMESTAMP_FORMAT};
use pgagent_smtp::parse_recipients;
use tracing::{info, warn};

use crate::aggregator::FailureBatch;
use crate::details::{display_name, HostProbe};
use crate::files::create_unique;

const DESCRIPTION_PREVIEW: usize = 50;
const ARTIFACT_PLACEHOLDER: &str = "job_failures_report.log";
const BANNER: &str = "################################################################################";
const RULE: &str = "--------------------------------------------------------------------------------";

/// A rendered alert, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAlert {
	pub subject: String,
	pub body_html: String,
	pub artifact: Option<PathBuf>,
	/// Replaces the configured recipients when present.
	pub recipients: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AlertComposer {
	artifact_dir: PathBuf,
	host: HostProbe,
}

impl AlertComposer {
	pub fn new(artifact_dir: impl Into<PathBuf>, host: HostProbe) -> Self {
		Self {
			artifact_dir: artifact_dir.into(),
			host,
		}
	}

	pub fn from_config(config: &AlertsConfig) -> Self {
		Self::new(&config.artifact_dir, HostProbe::from_config(config))
	}

	#[tracing::instrument(skip(self, batch), fields(failures = batch.len()))]
	pub async fn compose(&self, batch: &FailureBatch, now: DateTime<Utc>) -> OutboundAlert {
		let artifact = self.render_artifact(batch, now).await;
		let artifact_name = artifact.as_deref().map(display_name);

		OutboundAlert {
			subject: subject(batch),
			body_html: render_body(batch, artifact_name.as_deref(), now),
			artifact,
			recipients: recipient_override(batch),
		}
	}

	/// Write the plain-text report. `None` when the file cannot be written.
	/// Reports from the same second get distinct names.
	pub async fn render_artifact(&self, batch: &FailureBatch, now: DateTime<Utc>) -> Option<PathBuf> {
		let stamp = now.format(FILE_TIMESTAMP_FORMAT).to_string();

		let mut report = String::new();
		let _ = writeln!(report, "{BANNER}");
		let _ = writeln!(report, "#{:^78}#", "JOB FAILURE REPORT");
		let _ = writeln!(report, "{BANNER}");
		let _ = writeln!(report, "Generated at: {}", now.format(TIMESTAMP_FORMAT));
		let _ = writeln!(report, "Total Failures: {}", batch.len());
		let _ = writeln!(report);
		let _ = writeln!(report, "SYSTEM INFORMATION");
		let _ = writeln!(report, "{RULE}");
		report.push_str(&self.host.snapshot().await);

		for (index, record) in batch.records.iter().enumerate() {
			let _ = writeln!(report);
			let _ = writeln!(report, "{BANNER}");
			let _ = writeln!(report, "JOB FAILURE DETAILS ({} of {})", index + 1, batch.len());
			let _ = writeln!(report, "{BANNER}");
			let _ = writeln!(report, "Job ID: {}", record.job_id);
			let _ = writeln!(report, "Timestamp: {}", record.timestamp.format(TIMESTAMP_FORMAT));
			let _ = writeln!(report, "Description: {}", record.description);
			let _ = writeln!(report);
			let _ = writeln!(report, "DETAILED LOG");
			let _ = writeln!(report, "{RULE}");
			report.push_str(&record.detailed_log);
			if !record.detailed_log.ends_with('\n') {
				report.push('\n');
			}
		}

		match create_unique(&self.artifact_dir, "job_failures", &stamp, "log", report.as_bytes()).await {
			Ok(path) => {
				info!(path = %path.display(), "wrote failure report");
				Some(path)
			}
			Err(e) => {
				warn!(dir = %self.artifact_dir.display(), error = %e, "failed to write failure report");
				None
			}
		}
	}
}

pub fn subject(batch: &FailureBatch) -> String {
	if batch.len() == 1 {
		"ALERT: Job Failure Detected".to_string()
	} else {
		format!("ALERT: Multiple Job Failures ({})", batch.len())
	}
}

/// Self-contained HTML document. Every value taken from a record is escaped.
pub fn render_body(batch: &FailureBatch, artifact_name: Option<&str>, now: DateTime<Utc>) -> String {
	let generated = now.format(TIMESTAMP_FORMAT).to_string();
	let mut html = String::new();

	html.push_str(
		"<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n\
		 body { font-family: Arial, sans-serif; color: #333; }\n\
		 h2 { color: #c0392b; }\n\
		 table { border-collapse: collapse; width: 100%; }\n\
		 th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }\n\
		 th { background-color: #f2f2f2; }\n\
		 .custom { background-color: #fff8e1; padding: 10px; margin-top: 16px; }\n\
		 .footer { color: #888; font-size: 12px; margin-top: 24px; }\n\
		 </style>\n</head>\n<body>\n",
	);
	html.push_str("<h2>Job Failure Notification</h2>\n");
	let _ = writeln!(html, "<p><strong>Time of Report:</strong> {generated}</p>");
	let _ = writeln!(html, "<p><strong>Number of Failed Jobs:</strong> {}</p>", batch.len());

	html.push_str("<table>\n<tr><th>Job ID</th><th>Timestamp</th><th>Description</th><th>Actions</th></tr>\n");
	for record in &batch.records {
		let _ = writeln!(
			html,
			"<tr><td>{}</td><td>{}</td><td>{}</td><td>See attached report</td></tr>",
			html_escape(&record.job_id),
			html_escape(&record.timestamp.format(TIMESTAMP_FORMAT).to_string()),
			html_escape(&preview(&record.description)),
		);
	}
	html.push_str("</table>\n");

	let custom: Vec<_> = batch
		.records
		.iter()
		.filter_map(|r| r.custom_text.as_deref().map(|t| (r.job_id.as_str(), t)))
		.collect();
	if !custom.is_empty() {
		html.push_str("<div class=\"custom\">\n<h3>Custom Messages</h3>\n");
		for (job_id, text) in custom {
			let _ = writeln!(
				html,
				"<p><strong>Job {}:</strong><br>{}</p>",
				html_escape(job_id),
				html_escape(text).replace('\n', "<br>")
			);
		}
		html.push_str("</div>\n");
	}

	let _ = writeln!(
		html,
		"<p>Full system information and logs are attached in <code>{}</code>.</p>",
		html_escape(artifact_name.unwrap_or(ARTIFACT_PLACEHOLDER))
	);
	let _ = writeln!(
		html,
		"<p class=\"footer\">Generated by Job Notification System on {generated}</p>"
	);
	html.push_str("</body>\n</html>\n");
	html
}

/// The first record carrying recipients decides the override.
fn recipient_override(batch: &FailureBatch) -> Option<Vec<String>> {
	batch
		.records
		.iter()
		.filter_map(|r| r.email_recipients.as_deref())
		.map(parse_recipients)
		.find(|list| !list.is_empty())
}

fn preview(description: &str) -> String {
	if description.chars().count() > DESCRIPTION_PREVIEW {
		let head: String = description.chars().take(DESCRIPTION_PREVIEW - 3).collect();
		format!("{head}...")
	} else {
		description.to_string()
	}
}

pub fn html_escape(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#x27;"),
			c => out.push(c),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::aggregator::FailureRecord;
	use crate::test_time;
	use proptest::prelude::*;

	fn record(job_id: &str, description: &str) -> FailureRecord {
		FailureRecord {
			job_id: job_id.to_string(),
			timestamp: test_time("2025-05-05 09:59:00"),
			description: description.to_string(),
			detailed_log: format!("log for {job_id}"),
			email_recipients: None,
			custom_text: None,
		}
	}

	fn batch(records: Vec<FailureRecord>) -> FailureBatch {
		FailureBatch {
			started_at: records.first().map(|r| r.timestamp),
			records,
		}
	}

	fn composer(dir: &std::path::Path) -> AlertComposer {
		AlertComposer::new(
			dir,
			HostProbe {
				meminfo: dir.join("meminfo"),
				loadavg: dir.join("loadavg"),
			},
		)
	}

	#[test]
	fn subject_depends_on_batch_size() {
		let one = batch(vec![record("1", "a")]);
		let three = batch(vec![record("1", "a"), record("2", "b"), record("3", "c")]);

		assert_eq!(subject(&one), "ALERT: Job Failure Detected");
		assert_eq!(subject(&three), "ALERT: Multiple Job Failures (3)");
	}

	#[test]
	fn script_in_description_is_escaped() {
		let b = batch(vec![record("1", "<script>alert(1)</script>")]);
		let html = render_body(&b, None, test_time("2025-05-05 10:00:00"));

		assert!(!html.contains("<script>"));
		assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
	}

	#[test]
	fn long_descriptions_are_truncated() {
		let long = "x".repeat(80);
		let b = batch(vec![record("1", &long)]);
		let html = render_body(&b, None, test_time("2025-05-05 10:00:00"));

		assert!(html.contains(&format!("{}...", "x".repeat(47))));
		assert!(!html.contains(&"x".repeat(48)));
	}

	#[test]
	fn custom_text_keeps_line_breaks() {
		let mut r = record("4", "failed");
		r.custom_text = Some("call ops\n& page <oncall>".to_string());
		let html = render_body(&batch(vec![r]), Some("job_failures_x.log"), test_time("2025-05-05 10:00:00"));

		assert!(html.contains("Custom Messages"));
		assert!(html.contains("call ops<br>&amp; page &lt;oncall&gt;"));
		assert!(html.contains("job_failures_x.log"));
		assert!(html.contains("Generated by Job Notification System on 2025-05-05 10:00:00"));
	}

	#[test]
	fn placeholder_names_a_missing_artifact() {
		let html = render_body(&batch(vec![record("1", "a")]), None, test_time("2025-05-05 10:00:00"));
		assert!(html.contains(ARTIFACT_PLACEHOLDER));
		assert!(!html.contains("Custom Messages"));
	}

	#[test]
	fn override_comes_from_first_record_with_recipients() {
		let mut second = record("2", "b");
		second.email_recipients = Some(" ops@example.com , dba@example.com ".to_string());
		let mut third = record("3", "c");
		third.email_recipients = Some("late@example.com".to_string());
		let b = batch(vec![record("1", "a"), second, third]);

		assert_eq!(
			recipient_override(&b),
			Some(vec!["ops@example.com".to_string(), "dba@example.com".to_string()])
		);
		assert_eq!(recipient_override(&batch(vec![record("1", "a")])), None);
	}

	#[tokio::test]
	async fn artifact_contains_every_failure() {
		let dir = tempfile::tempdir().unwrap();
		let now = test_time("2025-05-05 10:00:00");
		let b = batch(vec![record("1", "disk full"), record("2", "timeout")]);

		let path = composer(dir.path()).render_artifact(&b, now).await.unwrap();
		assert_eq!(display_name(&path), "job_failures_2025-05-05_10-00-00.log");

		let report = std::fs::read_to_string(&path).unwrap();
		assert!(report.contains("JOB FAILURE REPORT"));
		assert!(report.contains("Generated at: 2025-05-05 10:00:00"));
		assert!(report.contains("Total Failures: 2"));
		assert!(report.contains("SYSTEM INFORMATION"));
		assert!(report.contains("Description: disk full"));
		assert!(report.contains("log for 2"));
		assert!(report.find("Job ID: 1").unwrap() < report.find("Job ID: 2").unwrap());
	}

	#[tokio::test]
	async fn reports_in_the_same_second_do_not_overwrite() {
		let dir = tempfile::tempdir().unwrap();
		let now = test_time("2025-05-05 10:00:00");
		let composer = composer(dir.path());

		let first = composer.render_artifact(&batch(vec![record("1", "a")]), now).await.unwrap();
		let second = composer.render_artifact(&batch(vec![record("2", "b")]), now).await.unwrap();

		assert_ne!(first, second);
		assert_eq!(display_name(&second), "job_failures_2025-05-05_10-00-00_1.log");
		assert!(std::fs::read_to_string(&first).unwrap().contains("Job ID: 1"));
		assert!(std::fs::read_to_string(&second).unwrap().contains("Job ID: 2"));
	}

	#[tokio::test]
	async fn unwritable_artifact_dir_still_composes() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("nope");
		let alert = composer(&missing)
			.compose(&batch(vec![record("1", "a")]), test_time("2025-05-05 10:00:00"))
			.await;

		assert_eq!(alert.artifact, None);
		assert!(alert.body_html.contains(ARTIFACT_PLACEHOLDER));
		assert_eq!(alert.subject, "ALERT: Job Failure Detected");
	}

	proptest! {
		#[test]
		fn one_row_per_record_in_order(ids in proptest::collection::vec("[0-9]{1,5}", 1..20)) {
			let records: Vec<_> = ids.iter().map(|id| record(id, "failed")).collect();
			let html = render_body(&batch(records), None, Utc::now());

			prop_assert_eq!(html.matches("<tr><td>").count(), ids.len());
			let mut cursor = 0;
			for id in &ids {
				let needle = format!("<tr><td>{id}</td>");
				let found = html[cursor..].find(&needle);
				prop_assert!(found.is_some());
				cursor += found.unwrap() + needle.len();
			}
		}

		#[test]
		fn escaped_text_has_no_angle_brackets(text in ".*") {
			let escaped = html_escape(&text);
			prop_assert!(!escaped.contains('<'));
			prop_assert!(!escaped.contains('>'));
		}
	}
}
