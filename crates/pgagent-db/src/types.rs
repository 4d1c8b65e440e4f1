// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

/// Raw notification settings row for one job.
///
/// Interval and last-notification time are kept as text so a malformed value
/// can be reported and ignored by the caller instead of failing the lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettingsRow {
	pub job_id: String,
	pub enabled: Option<bool>,
	pub browser: Option<bool>,
	pub email: Option<bool>,
	/// One of `a`, `s`, `f`, `b`.
	pub when: Option<String>,
	pub min_interval: Option<String>,
	pub email_recipients: Option<String>,
	pub custom_text: Option<String>,
	pub last_notification: Option<String>,
}

/// Outcome of one zombie sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
	/// Backend pids of agent registrations with no live session.
	pub dead_agents: Vec<i32>,
	/// Jobs whose running log rows were marked aborted.
	pub aborted_jobs: Vec<String>,
}

impl ReapReport {
	pub fn is_empty(&self) -> bool {
		self.dead_agents.is_empty() && self.aborted_jobs.is_empty()
	}
}

/// A job claimed by this agent, with its open job-log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRun {
	pub job_id: String,
	pub log_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
	Sql,
	Batch,
}

impl StepKind {
	pub fn from_code(code: &str) -> Option<Self> {
		match code {
			"s" => Some(StepKind::Sql),
			"b" => Some(StepKind::Batch),
			_ => None,
		}
	}
}

/// What a failing step does to the rest of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
	#[default]
	Fail,
	Succeed,
	Ignore,
}

impl OnError {
	pub fn from_code(code: &str) -> Self {
		match code {
			"s" => OnError::Succeed,
			"i" => OnError::Ignore,
			_ => OnError::Fail,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
	pub id: i32,
	pub name: String,
	pub kind: StepKind,
	pub code: String,
	pub on_error: OnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
	Succeeded,
	Failed,
	Ignored,
}

impl StepStatus {
	pub fn code(&self) -> &'static str {
		match self {
			StepStatus::Succeeded => "s",
			StepStatus::Failed => "f",
			StepStatus::Ignored => "i",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
	pub status: StepStatus,
	pub result: i32,
	pub output: String,
}
