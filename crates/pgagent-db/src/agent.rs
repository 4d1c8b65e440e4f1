// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{parse_job_id, Result};
use crate::event::{JobStatus, JobStatusEvent};
use crate::types::{
	ClaimedRun, JobStep, NotificationSettingsRow, OnError, ReapReport, StepKind, StepOutcome,
};

/// Queries and bookkeeping against the `pgagent` catalog.
#[derive(Clone)]
pub struct AgentRepository {
	pool: PgPool,
	channel: String,
}

impl AgentRepository {
	pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
		Self {
			pool,
			channel: channel.into(),
		}
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	#[tracing::instrument(skip(self))]
	pub async fn schema_present(&self) -> Result<bool> {
		let count: i64 = sqlx::query_scalar(
			r#"
			SELECT count(*)
			FROM pg_catalog.pg_class cl
			JOIN pg_catalog.pg_namespace ns ON ns.oid = cl.relnamespace
			WHERE cl.relname = 'pga_job' AND ns.nspname = 'pgagent'
			"#,
		)
		.fetch_one(&self.pool)
		.await?;

		Ok(count > 0)
	}

	/// `None` when `pgagent.pgagent_schema_version()` is not installed.
	#[tracing::instrument(skip(self))]
	pub async fn schema_version(&self) -> Result<Option<i16>> {
		let installed: bool = sqlx::query_scalar(
			r#"
			SELECT EXISTS (
				SELECT 1
				FROM pg_catalog.pg_proc p
				JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
				WHERE p.proname = 'pgagent_schema_version'
				  AND n.nspname = 'pgagent'
				  AND p.prorettype = 'pg_catalog.int2'::regtype
			)
			"#,
		)
		.fetch_one(&self.pool)
		.await?;

		if !installed {
			return Ok(None);
		}

		let version: i16 = sqlx::query_scalar("SELECT pgagent.pgagent_schema_version()")
			.fetch_one(&self.pool)
			.await?;
		Ok(Some(version))
	}

	/// Abort work owned by agents whose backend is gone and emit one failure
	/// event naming the aborted jobs. Runs in a single transaction; the event
	/// is delivered on commit.
	#[tracing::instrument(skip(self))]
	pub async fn reap_zombies(&self, now: DateTime<Utc>) -> Result<ReapReport> {
		let mut tx = self.pool.begin().await?;

		sqlx::query("LOCK TABLE pgagent.pga_jobagent IN SHARE ROW EXCLUSIVE MODE")
			.execute(&mut *tx)
			.await?;

		sqlx::query("CREATE TEMP TABLE pga_tmp_zombies (jagpid int4) ON COMMIT DROP")
			.persistent(false)
			.execute(&mut *tx)
			.await?;

		sqlx::query(
			r#"
			INSERT INTO pga_tmp_zombies (jagpid)
			SELECT AG.jagpid
			FROM pgagent.pga_jobagent AG
			LEFT JOIN pg_catalog.pg_stat_activity PA ON AG.jagpid = PA.pid
			WHERE PA.pid IS NULL
			"#,
		)
		.persistent(false)
		.execute(&mut *tx)
		.await?;

		let dead_agents: Vec<i32> =
			sqlx::query_scalar("SELECT jagpid FROM pga_tmp_zombies ORDER BY jagpid")
				.persistent(false)
				.fetch_all(&mut *tx)
				.await?;

		if dead_agents.is_empty() {
			tx.commit().await?;
			return Ok(ReapReport::default());
		}

		let aborted: Vec<i32> = sqlx::query_scalar(
			r#"
			SELECT DISTINCT L.jlgjobid
			FROM pga_tmp_zombies Z
			JOIN pgagent.pga_job J ON J.jobagentid = Z.jagpid
			JOIN pgagent.pga_joblog L ON L.jlgjobid = J.jobid
			WHERE L.jlgstatus = 'r'
			ORDER BY L.jlgjobid
			"#,
		)
		.persistent(false)
		.fetch_all(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE pgagent.pga_jobsteplog SET jslstatus = 'd'
			WHERE jslid IN (
				SELECT S.jslid
				FROM pga_tmp_zombies Z
				JOIN pgagent.pga_job J ON J.jobagentid = Z.jagpid
				JOIN pgagent.pga_joblog L ON L.jlgjobid = J.jobid
				JOIN pgagent.pga_jobsteplog S ON S.jsljlgid = L.jlgid
				WHERE S.jslstatus = 'r'
			)
			"#,
		)
		.persistent(false)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE pgagent.pga_joblog SET jlgstatus = 'd'
			WHERE jlgid IN (
				SELECT L.jlgid
				FROM pga_tmp_zombies Z
				JOIN pgagent.pga_job J ON J.jobagentid = Z.jagpid
				JOIN pgagent.pga_joblog L ON L.jlgjobid = J.jobid
				WHERE L.jlgstatus = 'r'
			)
			"#,
		)
		.persistent(false)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE pgagent.pga_job SET jobagentid = NULL, jobnextrun = NULL
			WHERE jobagentid IN (SELECT jagpid FROM pga_tmp_zombies)
			"#,
		)
		.persistent(false)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"DELETE FROM pgagent.pga_jobagent WHERE jagpid IN (SELECT jagpid FROM pga_tmp_zombies)",
		)
		.persistent(false)
		.execute(&mut *tx)
		.await?;

		let report = ReapReport {
			dead_agents,
			aborted_jobs: aborted.iter().map(|id| id.to_string()).collect(),
		};

		if let Some(event) = abort_event(&report, now) {
			sqlx::query("SELECT pg_notify($1, $2)")
				.bind(&self.channel)
				.bind(event.to_payload()?)
				.execute(&mut *tx)
				.await?;
		}

		tx.commit().await?;
		Ok(report)
	}

	/// Enabled, unclaimed, due jobs for this station, earliest first.
	#[tracing::instrument(skip(self))]
	pub async fn due_jobs(&self, station: &str) -> Result<Vec<String>> {
		let ids: Vec<i32> = sqlx::query_scalar(
			r#"
			SELECT J.jobid
			FROM pgagent.pga_job J
			WHERE J.jobenabled
			  AND J.jobagentid IS NULL
			  AND J.jobnextrun <= now()
			  AND (J.jobhostagent = '' OR J.jobhostagent = $1)
			ORDER BY J.jobnextrun
			"#,
		)
		.bind(station)
		.fetch_all(&self.pool)
		.await?;

		Ok(ids.into_iter().map(|id| id.to_string()).collect())
	}

	#[tracing::instrument(skip(self))]
	pub async fn notification_settings(
		&self,
		job_id: &str,
	) -> Result<Option<NotificationSettingsRow>> {
		let key = parse_job_id(job_id)?;
		let row = sqlx::query_as::<
			_,
			(
				Option<bool>,
				Option<bool>,
				Option<bool>,
				Option<String>,
				Option<String>,
				Option<String>,
				Option<String>,
				Option<String>,
			),
		>(
			r#"
			SELECT jnenabled, jnbrowser, jnemail, jnwhen::text, jnmininterval::text,
			       jnemailrecipients, jncustomtext,
			       to_char(jnlastnotification AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS')
			FROM pgagent.pga_jobnotification
			WHERE jnjobid = $1
			"#,
		)
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row.map(
			|(
				enabled,
				browser,
				email,
				when,
				min_interval,
				email_recipients,
				custom_text,
				last_notification,
			)| NotificationSettingsRow {
				job_id: job_id.to_string(),
				enabled,
				browser,
				email,
				when,
				min_interval,
				email_recipients,
				custom_text,
				last_notification,
			},
		))
	}

	#[tracing::instrument(skip(self))]
	pub async fn touch_last_notification(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
		let key = parse_job_id(job_id)?;
		sqlx::query("UPDATE pgagent.pga_jobnotification SET jnlastnotification = $2 WHERE jnjobid = $1")
			.bind(key)
			.bind(at)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	#[tracing::instrument(skip(self, event), fields(job_id = %event.job_id, status = %event.status))]
	pub async fn publish_status(&self, event: &JobStatusEvent) -> Result<()> {
		sqlx::query("SELECT pg_notify($1, $2)")
			.bind(&self.channel)
			.bind(event.to_payload()?)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	#[tracing::instrument(skip(self, event), fields(job_id = %event.job_id, status = %event.status))]
	pub async fn record_status(&self, event: &JobStatusEvent) -> Result<()> {
		let key = parse_job_id(&event.job_id)?;
		sqlx::query(
			r#"
			INSERT INTO pgagent.pga_jobstatus (jsjobid, jsstatus, jsdescription, jsupdated)
			VALUES ($1, $2, $3, $4)
			ON CONFLICT (jsjobid) DO UPDATE SET
				jsstatus = EXCLUDED.jsstatus,
				jsdescription = EXCLUDED.jsdescription,
				jsupdated = EXCLUDED.jsupdated
			"#,
		)
		.bind(key)
		.bind(event.status.code())
		.bind(&event.description)
		.bind(event.timestamp)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Claim a due job for `agent_id` and open its job-log row. `None` when
	/// another agent got there first.
	#[tracing::instrument(skip(self))]
	pub async fn claim_job(&self, job_id: &str, agent_id: i32) -> Result<Option<ClaimedRun>> {
		let key = parse_job_id(job_id)?;
		let mut tx = self.pool.begin().await?;

		let claimed = sqlx::query(
			r#"
			UPDATE pgagent.pga_job SET jobagentid = $2, joblastrun = now()
			WHERE jobagentid IS NULL AND jobid = $1
			"#,
		)
		.bind(key)
		.bind(agent_id)
		.execute(&mut *tx)
		.await?;

		if claimed.rows_affected() != 1 {
			tx.rollback().await?;
			return Ok(None);
		}

		let log_id: i32 = sqlx::query_scalar(
			"INSERT INTO pgagent.pga_joblog (jlgjobid, jlgstatus) VALUES ($1, 'r') RETURNING jlgid",
		)
		.bind(key)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(Some(ClaimedRun {
			job_id: job_id.to_string(),
			log_id,
		}))
	}

	/// Close the job-log row and release the claim. Clearing `jobnextrun`
	/// lets the catalog trigger schedule the next run.
	#[tracing::instrument(skip(self, run), fields(job_id = %run.job_id, log_id = run.log_id))]
	pub async fn finish_job(&self, run: &ClaimedRun, status: &JobStatus) -> Result<()> {
		let key = parse_job_id(&run.job_id)?;
		let mut tx = self.pool.begin().await?;

		sqlx::query(
			"UPDATE pgagent.pga_joblog SET jlgstatus = $2, jlgduration = now() - jlgstart WHERE jlgid = $1",
		)
		.bind(run.log_id)
		.bind(status.code())
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"UPDATE pgagent.pga_job SET jobagentid = NULL, jobnextrun = NULL WHERE jobid = $1",
		)
		.bind(key)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	/// Abort `agent_id`'s open run of `job_id` and release the claim, for a
	/// run whose worker died or could not record its result. `false` when
	/// the job is no longer claimed by this agent.
	#[tracing::instrument(skip(self))]
	pub async fn abort_job(&self, job_id: &str, agent_id: i32) -> Result<bool> {
		let key = parse_job_id(job_id)?;
		let mut tx = self.pool.begin().await?;

		let released = sqlx::query(
			r#"
			UPDATE pgagent.pga_job SET jobagentid = NULL, jobnextrun = NULL
			WHERE jobid = $1 AND jobagentid = $2
			"#,
		)
		.bind(key)
		.bind(agent_id)
		.execute(&mut *tx)
		.await?;

		if released.rows_affected() != 1 {
			tx.rollback().await?;
			return Ok(false);
		}

		sqlx::query(
			r#"
			UPDATE pgagent.pga_jobsteplog SET jslstatus = 'd'
			WHERE jslstatus = 'r' AND jsljlgid IN (
				SELECT jlgid FROM pgagent.pga_joblog WHERE jlgjobid = $1 AND jlgstatus = 'r'
			)
			"#,
		)
		.bind(key)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE pgagent.pga_joblog SET jlgstatus = 'd', jlgduration = now() - jlgstart
			WHERE jlgjobid = $1 AND jlgstatus = 'r'
			"#,
		)
		.bind(key)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(true)
	}

	#[tracing::instrument(skip(self))]
	pub async fn job_steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
		let key = parse_job_id(job_id)?;
		let rows = sqlx::query_as::<_, (i32, String, String, String, String)>(
			r#"
			SELECT jstid, jstname, jstkind::text, jstcode, jstonerror::text
			FROM pgagent.pga_jobstep
			WHERE jstenabled AND jstjobid = $1
			ORDER BY jstname, jstid
			"#,
		)
		.bind(key)
		.fetch_all(&self.pool)
		.await?;

		let mut steps = Vec::with_capacity(rows.len());
		for (id, name, kind, code, on_error) in rows {
			let Some(kind) = StepKind::from_code(&kind) else {
				tracing::warn!(step_id = id, kind = %kind, "skipping step with unknown kind");
				continue;
			};
			steps.push(JobStep {
				id,
				name,
				kind,
				code,
				on_error: OnError::from_code(&on_error),
			});
		}
		Ok(steps)
	}

	#[tracing::instrument(skip(self, run, step), fields(log_id = run.log_id, step_id = step.id))]
	pub async fn start_step(&self, run: &ClaimedRun, step: &JobStep) -> Result<i32> {
		let id: i32 = sqlx::query_scalar(
			"INSERT INTO pgagent.pga_jobsteplog (jsljlgid, jsljstid, jslstatus) VALUES ($1, $2, 'r') RETURNING jslid",
		)
		.bind(run.log_id)
		.bind(step.id)
		.fetch_one(&self.pool)
		.await?;
		Ok(id)
	}

	#[tracing::instrument(skip(self, outcome))]
	pub async fn finish_step(&self, step_log_id: i32, outcome: &StepOutcome) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE pgagent.pga_jobsteplog
			SET jslstatus = $2, jslresult = $3, jsloutput = $4, jslduration = now() - jslstart
			WHERE jslid = $1
			"#,
		)
		.bind(step_log_id)
		.bind(outcome.status.code())
		.bind(outcome.result)
		.bind(&outcome.output)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	#[tracing::instrument(skip(self, code))]
	pub async fn run_sql_step(&self, code: &str) -> Result<u64> {
		let result = sqlx::raw_sql(code).execute(&self.pool).await?;
		Ok(result.rows_affected())
	}
}

/// The single synthetic failure published after a sweep that aborted work.
pub fn abort_event(report: &ReapReport, now: DateTime<Utc>) -> Option<JobStatusEvent> {
	let first = report.aborted_jobs.first()?;
	Some(JobStatusEvent::new(
		first.clone(),
		JobStatus::Failure,
		format!(
			"Job aborted: the agent running it is no longer alive (aborted jobs: {})",
			report.aborted_jobs.join(", ")
		),
		now,
	))
}

#[async_trait]
pub trait AgentStore: Send + Sync {
	async fn schema_present(&self) -> Result<bool>;
	async fn schema_version(&self) -> Result<Option<i16>>;
	async fn reap_zombies(&self, now: DateTime<Utc>) -> Result<ReapReport>;
	async fn due_jobs(&self, station: &str) -> Result<Vec<String>>;
	async fn notification_settings(&self, job_id: &str)
		-> Result<Option<NotificationSettingsRow>>;
	async fn touch_last_notification(&self, job_id: &str, at: DateTime<Utc>) -> Result<()>;
	async fn publish_status(&self, event: &JobStatusEvent) -> Result<()>;
	async fn record_status(&self, event: &JobStatusEvent) -> Result<()>;
	async fn claim_job(&self, job_id: &str, agent_id: i32) -> Result<Option<ClaimedRun>>;
	async fn finish_job(&self, run: &ClaimedRun, status: &JobStatus) -> Result<()>;
	async fn abort_job(&self, job_id: &str, agent_id: i32) -> Result<bool>;
	async fn job_steps(&self, job_id: &str) -> Result<Vec<JobStep>>;
	async fn start_step(&self, run: &ClaimedRun, step: &JobStep) -> Result<i32>;
	async fn finish_step(&self, step_log_id: i32, outcome: &StepOutcome) -> Result<()>;
	async fn run_sql_step(&self, code: &str) -> Result<u64>;
}

#[async_trait]
impl AgentStore for AgentRepository {
	async fn schema_present(&self) -> Result<bool> {
		self.schema_present().await
	}

	async fn schema_version(&self) -> Result<Option<i16>> {
		self.schema_version().await
	}

	async fn reap_zombies(&self, now: DateTime<Utc>) -> Result<ReapReport> {
		self.reap_zombies(now).await
	}

	async fn due_jobs(&self, station: &str) -> Result<Vec<String>> {
		self.due_jobs(station).await
	}

	async fn notification_settings(
		&self,
		job_id: &str,
	) -> Result<Option<NotificationSettingsRow>> {
		self.notification_settings(job_id).await
	}

	async fn touch_last_notification(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
		self.touch_last_notification(job_id, at).await
	}

	async fn publish_status(&self, event: &JobStatusEvent) -> Result<()> {
		self.publish_status(event).await
	}

	async fn record_status(&self, event: &JobStatusEvent) -> Result<()> {
		self.record_status(event).await
	}

	async fn claim_job(&self, job_id: &str, agent_id: i32) -> Result<Option<ClaimedRun>> {
		self.claim_job(job_id, agent_id).await
	}

	async fn finish_job(&self, run: &ClaimedRun, status: &JobStatus) -> Result<()> {
		self.finish_job(run, status).await
	}

	async fn abort_job(&self, job_id: &str, agent_id: i32) -> Result<bool> {
		self.abort_job(job_id, agent_id).await
	}

	async fn job_steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
		self.job_steps(job_id).await
	}

	async fn start_step(&self, run: &ClaimedRun, step: &JobStep) -> Result<i32> {
		self.start_step(run, step).await
	}

	async fn finish_step(&self, step_log_id: i32, outcome: &StepOutcome) -> Result<()> {
		self.finish_step(step_log_id, outcome).await
	}

	async fn run_sql_step(&self, code: &str) -> Result<u64> {
		self.run_sql_step(code).await
	}
}
