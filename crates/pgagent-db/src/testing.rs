// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory stand-ins for the catalog and the status channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agent::{abort_event, AgentStore};
use crate::channel::{StatusChannel, MAX_DRAIN_BATCH};
use crate::connect::Connector;
use crate::error::{DbError, Result};
use crate::event::{JobStatus, JobStatusEvent};
use crate::types::{ClaimedRun, JobStep, NotificationSettingsRow, ReapReport, StepOutcome};

#[derive(Debug, Clone)]
pub struct MemoryJob {
	pub id: String,
	pub enabled: bool,
	pub host_agent: String,
	pub next_run: Option<DateTime<Utc>>,
	pub agent_id: Option<i32>,
	pub steps: Vec<JobStep>,
}

impl MemoryJob {
	pub fn due(id: &str, next_run: DateTime<Utc>) -> Self {
		Self {
			id: id.to_string(),
			enabled: true,
			host_agent: String::new(),
			next_run: Some(next_run),
			agent_id: None,
			steps: Vec::new(),
		}
	}
}

#[derive(Debug)]
struct State {
	schema_present: bool,
	schema_version: Option<i16>,
	jobs: Vec<MemoryJob>,
	settings: HashMap<String, NotificationSettingsRow>,
	agents: Vec<(i32, bool)>,
	running: HashSet<String>,
	next_agent_pid: i32,
	next_log_id: i32,
	touched: Vec<(String, DateTime<Utc>)>,
	statuses: HashMap<String, JobStatusEvent>,
	published: Vec<JobStatusEvent>,
	finished: Vec<(ClaimedRun, JobStatus)>,
	aborted: Vec<String>,
	step_logs: Vec<(i32, StepOutcome)>,
	executed_sql: Vec<String>,
	failing_sql: HashSet<String>,
}

impl Default for State {
	fn default() -> Self {
		Self {
			schema_present: true,
			schema_version: Some(4),
			jobs: Vec::new(),
			settings: HashMap::new(),
			agents: Vec::new(),
			running: HashSet::new(),
			next_agent_pid: 1000,
			next_log_id: 1,
			touched: Vec::new(),
			statuses: HashMap::new(),
			published: Vec::new(),
			finished: Vec::new(),
			aborted: Vec::new(),
			step_logs: Vec::new(),
			executed_sql: Vec::new(),
			failing_sql: HashSet::new(),
		}
	}
}

/// Catalog fake. Published events are queued for every [`MemoryChannel`]
/// created from the same store.
#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<State>,
	outbox: Arc<Mutex<VecDeque<String>>>,
	fail_queries: AtomicBool,
	fail_finish: AtomicBool,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn channel(self: &Arc<Self>) -> MemoryChannel {
		MemoryChannel {
			store: Arc::clone(self),
			lost: false,
			lose_after: None,
		}
	}

	pub fn set_schema(&self, present: bool, version: Option<i16>) {
		let mut state = self.state.lock().unwrap();
		state.schema_present = present;
		state.schema_version = version;
	}

	pub fn add_job(&self, job: MemoryJob) {
		self.state.lock().unwrap().jobs.push(job);
	}

	pub fn job(&self, id: &str) -> Option<MemoryJob> {
		self.state
			.lock()
			.unwrap()
			.jobs
			.iter()
			.find(|j| j.id == id)
			.cloned()
	}

	pub fn set_settings(&self, row: NotificationSettingsRow) {
		self.state
			.lock()
			.unwrap()
			.settings
			.insert(row.job_id.clone(), row);
	}

	/// Make every query fail with a driver error.
	pub fn fail_queries(&self, fail: bool) {
		self.fail_queries.store(fail, Ordering::SeqCst);
	}

	/// Make `finish_job` fail while other queries keep working.
	pub fn fail_finish(&self, fail: bool) {
		self.fail_finish.store(fail, Ordering::SeqCst);
	}

	pub fn fail_sql(&self, code: &str) {
		self.state
			.lock()
			.unwrap()
			.failing_sql
			.insert(code.to_string());
	}

	/// An agent registration whose session is gone, owning `running_job`.
	pub fn add_dead_agent(&self, pid: i32, running_job: Option<&str>) {
		let mut state = self.state.lock().unwrap();
		state.agents.push((pid, false));
		if let Some(job_id) = running_job {
			if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
				job.agent_id = Some(pid);
			}
			state.running.insert(job_id.to_string());
		}
	}

	pub fn agents(&self) -> Vec<(i32, bool)> {
		self.state.lock().unwrap().agents.clone()
	}

	/// Queue a raw payload as if another session had notified it.
	pub fn push_raw(&self, payload: &str) {
		self.outbox.lock().unwrap().push_back(payload.to_string());
	}

	pub fn touched(&self) -> Vec<(String, DateTime<Utc>)> {
		self.state.lock().unwrap().touched.clone()
	}

	pub fn status_of(&self, job_id: &str) -> Option<JobStatusEvent> {
		self.state.lock().unwrap().statuses.get(job_id).cloned()
	}

	pub fn published(&self) -> Vec<JobStatusEvent> {
		self.state.lock().unwrap().published.clone()
	}

	pub fn finished(&self) -> Vec<(ClaimedRun, JobStatus)> {
		self.state.lock().unwrap().finished.clone()
	}

	/// Jobs released through `abort_job`.
	pub fn aborted(&self) -> Vec<String> {
		self.state.lock().unwrap().aborted.clone()
	}

	pub fn step_logs(&self) -> Vec<(i32, StepOutcome)> {
		self.state.lock().unwrap().step_logs.clone()
	}

	pub fn executed_sql(&self) -> Vec<String> {
		self.state.lock().unwrap().executed_sql.clone()
	}

	fn check(&self) -> Result<()> {
		if self.fail_queries.load(Ordering::SeqCst) {
			return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
		}
		Ok(())
	}

	fn notify(&self, event: &JobStatusEvent) -> Result<()> {
		let payload = event.to_payload()?;
		self.state.lock().unwrap().published.push(event.clone());
		self.outbox.lock().unwrap().push_back(payload);
		Ok(())
	}
}

#[async_trait]
impl AgentStore for MemoryStore {
	async fn schema_present(&self) -> Result<bool> {
		self.check()?;
		Ok(self.state.lock().unwrap().schema_present)
	}

	async fn schema_version(&self) -> Result<Option<i16>> {
		self.check()?;
		Ok(self.state.lock().unwrap().schema_version)
	}

	async fn reap_zombies(&self, now: DateTime<Utc>) -> Result<ReapReport> {
		self.check()?;
		let report = {
			let mut state = self.state.lock().unwrap();
			let dead: Vec<i32> = state
				.agents
				.iter()
				.filter(|(_, alive)| !alive)
				.map(|(pid, _)| *pid)
				.collect();

			let mut aborted = Vec::new();
			let running = state.running.clone();
			for job in state.jobs.iter_mut() {
				if job.agent_id.is_some_and(|pid| dead.contains(&pid)) {
					if running.contains(&job.id) {
						aborted.push(job.id.clone());
					}
					job.agent_id = None;
					job.next_run = None;
				}
			}
			for id in &aborted {
				state.running.remove(id);
			}
			state.agents.retain(|(_, alive)| *alive);

			ReapReport {
				dead_agents: dead,
				aborted_jobs: aborted,
			}
		};

		if let Some(event) = abort_event(&report, now) {
			self.notify(&event)?;
		}
		Ok(report)
	}

	async fn due_jobs(&self, station: &str) -> Result<Vec<String>> {
		self.check()?;
		let now = Utc::now();
		let state = self.state.lock().unwrap();
		let mut due: Vec<&MemoryJob> = state
			.jobs
			.iter()
			.filter(|j| j.enabled && j.agent_id.is_none())
			.filter(|j| j.next_run.is_some_and(|at| at <= now))
			.filter(|j| j.host_agent.is_empty() || j.host_agent == station)
			.collect();
		due.sort_by_key(|j| j.next_run);
		Ok(due.into_iter().map(|j| j.id.clone()).collect())
	}

	async fn notification_settings(
		&self,
		job_id: &str,
	) -> Result<Option<NotificationSettingsRow>> {
		self.check()?;
		Ok(self.state.lock().unwrap().settings.get(job_id).cloned())
	}

	async fn touch_last_notification(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
		self.check()?;
		let mut state = self.state.lock().unwrap();
		state.touched.push((job_id.to_string(), at));
		if let Some(row) = state.settings.get_mut(job_id) {
			row.last_notification = Some(at.format(crate::event::TIMESTAMP_FORMAT).to_string());
		}
		Ok(())
	}

	async fn publish_status(&self, event: &JobStatusEvent) -> Result<()> {
		self.check()?;
		self.notify(event)
	}

	async fn record_status(&self, event: &JobStatusEvent) -> Result<()> {
		self.check()?;
		self.state
			.lock()
			.unwrap()
			.statuses
			.insert(event.job_id.clone(), event.clone());
		Ok(())
	}

	async fn claim_job(&self, job_id: &str, agent_id: i32) -> Result<Option<ClaimedRun>> {
		self.check()?;
		let mut state = self.state.lock().unwrap();
		let log_id = state.next_log_id;
		let Some(job) = state
			.jobs
			.iter_mut()
			.find(|j| j.id == job_id && j.agent_id.is_none())
		else {
			return Ok(None);
		};
		job.agent_id = Some(agent_id);
		state.next_log_id += 1;
		state.running.insert(job_id.to_string());
		Ok(Some(ClaimedRun {
			job_id: job_id.to_string(),
			log_id,
		}))
	}

	async fn finish_job(&self, run: &ClaimedRun, status: &JobStatus) -> Result<()> {
		self.check()?;
		if self.fail_finish.load(Ordering::SeqCst) {
			return Err(DbError::Internal("could not close job log".to_string()));
		}
		let mut state = self.state.lock().unwrap();
		if let Some(job) = state.jobs.iter_mut().find(|j| j.id == run.job_id) {
			job.agent_id = None;
			job.next_run = None;
		}
		state.running.remove(&run.job_id);
		state.finished.push((run.clone(), status.clone()));
		Ok(())
	}

	async fn abort_job(&self, job_id: &str, agent_id: i32) -> Result<bool> {
		self.check()?;
		let mut state = self.state.lock().unwrap();
		let Some(job) = state
			.jobs
			.iter_mut()
			.find(|j| j.id == job_id && j.agent_id == Some(agent_id))
		else {
			return Ok(false);
		};
		job.agent_id = None;
		job.next_run = None;
		state.running.remove(job_id);
		state.aborted.push(job_id.to_string());
		Ok(true)
	}

	async fn job_steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
		self.check()?;
		Ok(self
			.state
			.lock()
			.unwrap()
			.jobs
			.iter()
			.find(|j| j.id == job_id)
			.map(|j| j.steps.clone())
			.unwrap_or_default())
	}

	async fn start_step(&self, _run: &ClaimedRun, step: &JobStep) -> Result<i32> {
		self.check()?;
		Ok(step.id)
	}

	async fn finish_step(&self, step_log_id: i32, outcome: &StepOutcome) -> Result<()> {
		self.check()?;
		self.state
			.lock()
			.unwrap()
			.step_logs
			.push((step_log_id, outcome.clone()));
		Ok(())
	}

	async fn run_sql_step(&self, code: &str) -> Result<u64> {
		self.check()?;
		let mut state = self.state.lock().unwrap();
		state.executed_sql.push(code.to_string());
		if state.failing_sql.contains(code) {
			return Err(DbError::Internal(format!("statement failed: {code}")));
		}
		Ok(1)
	}
}

pub struct MemoryChannel {
	store: Arc<MemoryStore>,
	lost: bool,
	lose_after: Option<usize>,
}

impl MemoryChannel {
	/// The next drain reports a lost connection.
	pub fn lose_connection(&mut self) {
		self.lost = true;
	}

	/// The connection drops during the next drain, after `received`
	/// payloads have been taken.
	pub fn lose_connection_after(&mut self, received: usize) {
		self.lose_after = Some(received);
	}
}

#[async_trait]
impl StatusChannel for MemoryChannel {
	async fn register_agent(&mut self, _station: &str) -> Result<i32> {
		self.store.check()?;
		let mut state = self.store.state.lock().unwrap();
		let pid = state.next_agent_pid;
		state.next_agent_pid += 1;
		state.agents.push((pid, true));
		Ok(pid)
	}

	async fn drain(&mut self) -> Result<Vec<String>> {
		if self.lost {
			return Err(DbError::ConnectionLost);
		}

		let mut outbox = self.store.outbox.lock().unwrap();
		let mut take = outbox.len().min(MAX_DRAIN_BATCH);
		if let Some(received) = self.lose_after.take() {
			self.lost = true;
			take = take.min(received);
			if take == 0 {
				return Err(DbError::ConnectionLost);
			}
		}
		Ok(outbox.drain(..take).collect())
	}
}

/// Hands out the same store on every connect; the first `failures` attempts
/// fail.
pub struct MemoryConnector {
	store: Arc<MemoryStore>,
	failures: usize,
	attempts: AtomicUsize,
}

impl MemoryConnector {
	pub fn new(store: Arc<MemoryStore>) -> Self {
		Self::failing(store, 0)
	}

	pub fn failing(store: Arc<MemoryStore>, failures: usize) -> Self {
		Self {
			store,
			failures,
			attempts: AtomicUsize::new(0),
		}
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Connector for MemoryConnector {
	type Store = MemoryStore;
	type Channel = MemoryChannel;

	async fn connect(&self) -> Result<(Arc<MemoryStore>, MemoryChannel)> {
		let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
		if attempt < self.failures {
			return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
		}
		Ok((Arc::clone(&self.store), self.store.channel()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	#[tokio::test]
	async fn drain_hands_over_received_payloads_before_the_loss() {
		let store = MemoryStore::new();
		let mut channel = store.channel();
		store.push_raw("a");
		store.push_raw("b");
		store.push_raw("c");
		channel.lose_connection_after(2);

		assert_eq!(channel.drain().await.unwrap(), vec!["a", "b"]);
		assert!(matches!(channel.drain().await, Err(DbError::ConnectionLost)));
	}

	#[tokio::test]
	async fn drain_is_bounded_per_call() {
		let store = MemoryStore::new();
		let mut channel = store.channel();
		for i in 0..MAX_DRAIN_BATCH + 5 {
			store.push_raw(&i.to_string());
		}

		assert_eq!(channel.drain().await.unwrap().len(), MAX_DRAIN_BATCH);
		assert_eq!(channel.drain().await.unwrap().len(), 5);
		assert!(channel.drain().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn due_jobs_are_ordered_and_filtered() {
		let store = MemoryStore::new();
		let now = Utc::now();
		store.add_job(MemoryJob::due("2", now - Duration::seconds(10)));
		store.add_job(MemoryJob::due("1", now - Duration::seconds(60)));
		store.add_job(MemoryJob::due("3", now + Duration::seconds(60)));
		store.add_job(MemoryJob {
			host_agent: "other-host".to_string(),
			..MemoryJob::due("4", now - Duration::seconds(60))
		});

		assert_eq!(store.due_jobs("this-host").await.unwrap(), vec!["1", "2"]);
	}

	#[tokio::test]
	async fn reap_is_idempotent() {
		let store = MemoryStore::new();
		store.add_job(MemoryJob::due("9", Utc::now()));
		store.add_dead_agent(77, Some("9"));

		let first = store.reap_zombies(Utc::now()).await.unwrap();
		assert_eq!(first.dead_agents, vec![77]);
		assert_eq!(first.aborted_jobs, vec!["9"]);
		assert_eq!(store.published().len(), 1);

		let second = store.reap_zombies(Utc::now()).await.unwrap();
		assert!(second.is_empty());
		assert_eq!(store.published().len(), 1);
	}

	#[tokio::test]
	async fn published_events_reach_the_channel() {
		let store = MemoryStore::new();
		let mut channel = store.channel();
		let event = JobStatusEvent::new("5", JobStatus::Success, "ok", Utc::now());
		store.publish_status(&event).await.unwrap();

		let payloads = channel.drain().await.unwrap();
		assert_eq!(payloads.len(), 1);
		assert!(channel.drain().await.unwrap().is_empty());
	}
}
