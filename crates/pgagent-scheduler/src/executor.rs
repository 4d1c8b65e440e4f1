// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Running a claimed job's steps.

use std::sync::Arc;

use async_trait::async_trait;
use pgagent_db::{
	truncate_text, AgentStore, ClaimedRun, JobStatus, JobStep, OnError, StepKind, StepOutcome,
	StepStatus, MAX_DESCRIPTION_BYTES,
};
use tracing::{debug, instrument, warn};

/// Terminal result of one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
	pub status: JobStatus,
	pub description: String,
}

impl JobOutcome {
	pub fn success(description: impl Into<String>) -> Self {
		Self {
			status: JobStatus::Success,
			description: description.into(),
		}
	}

	pub fn failure(description: impl Into<String>) -> Self {
		Self {
			status: JobStatus::Failure,
			description: description.into(),
		}
	}

	/// The catalog could not be read; recorded as an internal error (`i`).
	pub fn internal(description: impl Into<String>) -> Self {
		Self {
			status: JobStatus::Other("i".to_string()),
			description: description.into(),
		}
	}
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
	async fn execute(&self, run: &ClaimedRun) -> JobOutcome;
}

/// Runs SQL steps through the store and batch steps through `sh -c`.
pub struct StepExecutor<S: AgentStore + ?Sized> {
	store: Arc<S>,
	shell: String,
}

impl<S: AgentStore + ?Sized> StepExecutor<S> {
	pub fn new(store: Arc<S>) -> Self {
		Self {
			store,
			shell: "sh".to_string(),
		}
	}

	pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
		self.shell = shell.into();
		self
	}

	async fn run_step(&self, step: &JobStep) -> (bool, i32, String) {
		match step.kind {
			StepKind::Sql => match self.store.run_sql_step(&step.code).await {
				Ok(rows) => (true, i32::try_from(rows).unwrap_or(i32::MAX), String::new()),
				Err(e) => (false, -1, e.to_string()),
			},
			StepKind::Batch => run_batch(&self.shell, &step.code).await,
		}
	}
}

#[async_trait]
impl<S: AgentStore + ?Sized + 'static> JobExecutor for StepExecutor<S> {
	#[instrument(skip(self, run), fields(job_id = %run.job_id, log_id = run.log_id))]
	async fn execute(&self, run: &ClaimedRun) -> JobOutcome {
		let steps = match self.store.job_steps(&run.job_id).await {
			Ok(steps) => steps,
			Err(e) => return JobOutcome::internal(format!("Failed to load job steps: {e}")),
		};

		if steps.is_empty() {
			return JobOutcome::success("Job completed (no enabled steps)");
		}

		for step in &steps {
			let step_log_id = match self.store.start_step(run, step).await {
				Ok(id) => id,
				Err(e) => {
					return JobOutcome::internal(format!("Failed to start step '{}': {e}", step.name))
				}
			};

			let (succeeded, result, output) = self.run_step(step).await;
			let status = match (succeeded, step.on_error) {
				(true, _) => StepStatus::Succeeded,
				(false, OnError::Fail) => StepStatus::Failed,
				(false, OnError::Succeed) => StepStatus::Succeeded,
				(false, OnError::Ignore) => StepStatus::Ignored,
			};
			debug!(step = %step.name, status = status.code(), result, "step finished");

			let outcome = StepOutcome {
				status,
				result,
				output: output.clone(),
			};
			if let Err(e) = self.store.finish_step(step_log_id, &outcome).await {
				warn!(step = %step.name, error = %e, "failed to record step outcome");
			}

			if status == StepStatus::Failed {
				let detail = output.trim();
				let description = if detail.is_empty() {
					format!("Step '{}' failed with result {result}", step.name)
				} else {
					format!("Step '{}' failed: {detail}", step.name)
				};
				return JobOutcome::failure(truncate_text(&description, MAX_DESCRIPTION_BYTES));
			}
		}

		JobOutcome::success(format!("Job completed successfully ({} steps)", steps.len()))
	}
}

async fn run_batch(shell: &str, code: &str) -> (bool, i32, String) {
	let output = match tokio::process::Command::new(shell)
		.arg("-c")
		.arg(code)
		.kill_on_drop(true)
		.output()
		.await
	{
		Ok(output) => output,
		Err(e) => return (false, -1, format!("failed to start {shell}: {e}")),
	};

	let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
	text.push_str(&String::from_utf8_lossy(&output.stderr));
	let code = output.status.code().unwrap_or(-1);
	(output.status.success(), code, text)
}
