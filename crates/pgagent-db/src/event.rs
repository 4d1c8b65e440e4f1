// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job status events and their JSON payload on the status channel.
//!
//! Payloads look like:
//!
//! ```json
//! {"job_id":"42","status":"f","description":"step 2 failed","timestamp":"2025-03-01 12:00:05"}
//! ```
//!
//! `custom_text` and a `notification` object (`{"browser":true,"email":false}`)
//! are optional. Forward slashes are escaped as `\/` on the way out.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used in payloads, reports and log lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layout used in artifact and fallback file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// PostgreSQL rejects `pg_notify` payloads of this many bytes or more.
pub const MAX_PAYLOAD_BYTES: usize = 8000;

/// Longest description carried on the wire. Full step output stays in the
/// step log.
pub const MAX_DESCRIPTION_BYTES: usize = 1024;

const MAX_CUSTOM_TEXT_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
	Success,
	Failure,
	/// Any other terminal code, e.g. `d` for aborted or `i` for internal error.
	Other(String),
}

impl JobStatus {
	pub fn from_code(code: &str) -> Self {
		match code {
			"s" => JobStatus::Success,
			"f" => JobStatus::Failure,
			other => JobStatus::Other(other.to_string()),
		}
	}

	pub fn code(&self) -> &str {
		match self {
			JobStatus::Success => "s",
			JobStatus::Failure => "f",
			JobStatus::Other(code) => code,
		}
	}

	pub fn is_failure(&self) -> bool {
		matches!(self, JobStatus::Failure)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			JobStatus::Success => f.write_str("success"),
			JobStatus::Failure => f.write_str("failure"),
			JobStatus::Other(code) => write!(f, "status '{code}'"),
		}
	}
}

/// Delivery channels requested by the publisher of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags {
	#[serde(default)]
	pub browser: bool,
	#[serde(default)]
	pub email: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusEvent {
	pub job_id: String,
	pub status: JobStatus,
	pub description: String,
	pub timestamp: DateTime<Utc>,
	pub custom_text: Option<String>,
	pub channels: Option<ChannelFlags>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("payload is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),

	#[error("payload is missing required field '{0}'")]
	MissingField(&'static str),
}

#[derive(Serialize)]
struct OutgoingPayload<'a> {
	job_id: &'a str,
	status: &'a str,
	description: &'a str,
	timestamp: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	custom_text: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	notification: Option<ChannelFlags>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireJobId {
	Text(String),
	Number(i64),
}

#[derive(Deserialize)]
struct IncomingPayload {
	job_id: Option<WireJobId>,
	status: Option<String>,
	description: Option<String>,
	timestamp: Option<String>,
	custom_text: Option<String>,
	notification: Option<ChannelFlags>,
}

impl JobStatusEvent {
	pub fn new(
		job_id: impl Into<String>,
		status: JobStatus,
		description: impl Into<String>,
		timestamp: DateTime<Utc>,
	) -> Self {
		Self {
			job_id: job_id.into(),
			status,
			description: description.into(),
			timestamp,
			custom_text: None,
			channels: None,
		}
	}

	/// Serialize for `pg_notify`. Long text is cut so the payload stays
	/// under [`MAX_PAYLOAD_BYTES`].
	pub fn to_payload(&self) -> Result<String, serde_json::Error> {
		let custom_text = self
			.custom_text
			.as_deref()
			.map(|text| truncate_text(text, MAX_CUSTOM_TEXT_BYTES));
		let timestamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();

		let mut limit = MAX_DESCRIPTION_BYTES;
		loop {
			let description = truncate_text(&self.description, limit);
			let payload = OutgoingPayload {
				job_id: &self.job_id,
				status: self.status.code(),
				description: &description,
				timestamp: timestamp.clone(),
				custom_text: custom_text.as_deref(),
				notification: self.channels,
			};
			let encoded = serde_json::to_string(&payload)?.replace('/', "\\/");
			// Escaping can grow control characters sixfold.
			if encoded.len() < MAX_PAYLOAD_BYTES || limit == 0 {
				return Ok(encoded);
			}
			limit /= 2;
		}
	}

	/// Decode a channel payload. A missing or unreadable timestamp falls back
	/// to `received_at`.
	pub fn from_payload(payload: &str, received_at: DateTime<Utc>) -> Result<Self, DecodeError> {
		let incoming: IncomingPayload = serde_json::from_str(payload)?;

		let job_id = match incoming.job_id {
			Some(WireJobId::Text(id)) if !id.trim().is_empty() => id.trim().to_string(),
			Some(WireJobId::Number(id)) => id.to_string(),
			_ => return Err(DecodeError::MissingField("job_id")),
		};

		let status = match incoming.status {
			Some(code) if !code.trim().is_empty() => JobStatus::from_code(code.trim()),
			_ => return Err(DecodeError::MissingField("status")),
		};

		let timestamp = incoming
			.timestamp
			.as_deref()
			.and_then(parse_timestamp)
			.unwrap_or(received_at);

		Ok(Self {
			job_id,
			status,
			description: incoming.description.unwrap_or_default(),
			timestamp,
			custom_text: incoming.custom_text.filter(|t| !t.is_empty()),
			channels: incoming.notification,
		})
	}
}

/// Cut `value` to at most `max_bytes` on a char boundary, marking the cut
/// with `...`.
pub fn truncate_text(value: &str, max_bytes: usize) -> Cow<'_, str> {
	if value.len() <= max_bytes {
		return Cow::Borrowed(value);
	}
	let mut end = max_bytes.saturating_sub(3);
	while !value.is_char_boundary(end) {
		end -= 1;
	}
	Cow::Owned(format!("{}...", &value[..end]))
}

/// Parse `YYYY-MM-DD HH:MM:SS` (read as UTC) or RFC 3339.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
	let value = value.trim();
	if let Ok(naive) = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
		return Some(Utc.from_utc_datetime(&naive));
	}
	DateTime::parse_from_rfc3339(value)
		.ok()
		.map(|ts| ts.with_timezone(&Utc))
}
