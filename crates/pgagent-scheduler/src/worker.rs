// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::Utc;
use pgagent_db::{AgentStore, JobStatus, JobStatusEvent};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::executor::{JobExecutor, JobOutcome};

/// Claim, run, record and announce one job. `Ok(None)` when another agent
/// claimed it first.
#[instrument(skip(store, executor))]
pub async fn run_job<S, E>(
	store: &S,
	executor: &E,
	job_id: &str,
	agent_id: i32,
) -> Result<Option<JobOutcome>>
where
	S: AgentStore + ?Sized,
	E: JobExecutor + ?Sized,
{
	let Some(run) = store.claim_job(job_id, agent_id).await? else {
		info!("job already claimed elsewhere");
		return Ok(None);
	};

	let outcome = executor.execute(&run).await;

	if let Err(e) = store.finish_job(&run, &outcome.status).await {
		abandon_job(store, job_id, agent_id, &format!("its result could not be recorded ({e})")).await;
		return Err(e.into());
	}

	let event = JobStatusEvent::new(
		job_id,
		outcome.status.clone(),
		outcome.description.clone(),
		Utc::now(),
	);
	if let Err(e) = store.publish_status(&event).await {
		warn!(error = %e, "failed to publish job status");
	}

	info!(status = %outcome.status, description = %outcome.description, "job finished");
	Ok(Some(outcome))
}

/// Abort a claimed run that cannot finish normally, release the claim and
/// announce the job as failed.
#[instrument(skip(store))]
pub async fn abandon_job<S>(store: &S, job_id: &str, agent_id: i32, reason: &str)
where
	S: AgentStore + ?Sized,
{
	match store.abort_job(job_id, agent_id).await {
		Ok(true) => {}
		Ok(false) => warn!("job was no longer claimed by this agent"),
		Err(e) => warn!(error = %e, "failed to release job claim"),
	}

	let event = JobStatusEvent::new(
		job_id,
		JobStatus::Failure,
		format!("Job aborted: {reason}"),
		Utc::now(),
	);
	if let Err(e) = store.publish_status(&event).await {
		warn!(error = %e, "failed to publish job abort");
	}
}
