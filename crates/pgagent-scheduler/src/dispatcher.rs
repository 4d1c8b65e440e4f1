// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded, supervised job dispatch.
//!
//! Each due job gets its own worker task, holding one of
//! `max_concurrent_jobs` semaphore permits. When no permit is free the job is
//! left unclaimed and picked up again on a later cycle.

use std::collections::HashSet;
use std::sync::Arc;

use pgagent_db::AgentStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::executor::JobExecutor;
use crate::worker::{abandon_job, run_job};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
	pub due: usize,
	pub started: usize,
	pub deferred: usize,
}

pub struct JobDispatcher<S: AgentStore + ?Sized> {
	store: Arc<S>,
	executor: Arc<dyn JobExecutor>,
	agent_id: i32,
	station: String,
	permits: Arc<Semaphore>,
	workers: JoinSet<String>,
	in_flight: HashSet<String>,
}

impl<S: AgentStore + ?Sized + 'static> JobDispatcher<S> {
	pub fn new(
		store: Arc<S>,
		executor: Arc<dyn JobExecutor>,
		agent_id: i32,
		station: impl Into<String>,
		max_concurrent_jobs: usize,
	) -> Self {
		Self {
			store,
			executor,
			agent_id,
			station: station.into(),
			permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
			workers: JoinSet::new(),
			in_flight: HashSet::new(),
		}
	}

	/// Ids of runnable jobs, earliest next run first.
	pub async fn poll_due(&self) -> Result<Vec<String>> {
		Ok(self.store.due_jobs(&self.station).await?)
	}

	/// Start a worker for `job_id`. `false` means the job was deferred.
	pub fn dispatch(&mut self, job_id: &str) -> bool {
		if self.in_flight.contains(job_id) {
			debug!(job_id, "job already has a worker");
			return false;
		}

		let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
			debug!(job_id, "all workers busy, deferring job");
			return false;
		};

		let store = Arc::clone(&self.store);
		let executor = Arc::clone(&self.executor);
		let agent_id = self.agent_id;
		let id = job_id.to_string();

		self.in_flight.insert(id.clone());
		self.workers.spawn(async move {
			let _permit = permit;
			let job_id = id.clone();
			let worker_store = Arc::clone(&store);
			let worker = tokio::spawn(async move {
				run_job(worker_store.as_ref(), executor.as_ref(), &job_id, agent_id).await
			});
			match worker.await {
				Ok(Ok(_)) => {}
				Ok(Err(e)) => error!(job_id = %id, error = %e, "job worker failed"),
				Err(e) => {
					error!(job_id = %id, error = %e, "job worker panicked");
					abandon_job(store.as_ref(), &id, agent_id, "the worker running it panicked").await;
				}
			}
			id
		});
		true
	}

	/// Reap finished workers, then start workers for due jobs in order.
	#[instrument(skip(self), fields(agent_id = self.agent_id))]
	pub async fn dispatch_due(&mut self) -> Result<DispatchSummary> {
		self.reap_finished();

		let due = self.poll_due().await?;
		let mut summary = DispatchSummary {
			due: due.len(),
			..Default::default()
		};

		for job_id in &due {
			if self.dispatch(job_id) {
				summary.started += 1;
			} else {
				summary.deferred += 1;
			}
		}

		if summary.started > 0 || summary.deferred > 0 {
			info!(
				due = summary.due,
				started = summary.started,
				deferred = summary.deferred,
				"dispatched due jobs"
			);
		}
		Ok(summary)
	}

	/// Collect workers that have finished.
	pub fn reap_finished(&mut self) -> usize {
		let mut reaped = 0;
		while let Some(joined) = self.workers.try_join_next() {
			self.record_join(joined);
			reaped += 1;
		}
		reaped
	}

	pub fn in_flight(&self) -> usize {
		self.workers.len()
	}

	/// Wait for every running worker.
	pub async fn shutdown(&mut self) {
		let running = self.workers.len();
		if running > 0 {
			info!(running, "waiting for job workers to finish");
		}
		while let Some(joined) = self.workers.join_next().await {
			self.record_join(joined);
		}
	}

	fn record_join(&mut self, joined: std::result::Result<String, tokio::task::JoinError>) {
		match joined {
			Ok(job_id) => {
				self.in_flight.remove(&job_id);
			}
			Err(e) => {
				warn!(error = %e, "job worker task was cancelled");
				if self.workers.is_empty() {
					self.in_flight.clear();
				}
			}
		}
	}
}
