// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The agent's control loop.
//!
//! ```text
//! Connecting{attempt} --ok--> Running --connection lost--> Connecting{1}
//!        |                       |
//!        | attempts exhausted    | schema check failed (enforced)
//!        v                       v
//!     Stopped                  Halted
//! ```
//!
//! Cancellation from any state ends in `ShutDown`, after running workers
//! finish and any pending failure batch has been sent once.

use std::sync::Arc;

use chrono::Utc;
use pgagent_config::{AgentConfig, AlertsConfig};
use pgagent_db::{AgentStore, Connector, StatusChannel};
use pgagent_notify::{DetailCollector, NotificationListener, NotificationPipeline};
use pgagent_smtp::MailRelay;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{sleep_unless_cancelled, CancellationToken};
use crate::dispatcher::JobDispatcher;
use crate::error::{Result, SchedulerError};
use crate::executor::StepExecutor;
use crate::reaper::ZombieReaper;

/// Catalog version this agent is built against.
pub const SCHEMA_VERSION: i16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
	Connecting { attempt: u32 },
	Running,
	Stopped,
	Halted,
	ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
	/// Cancelled.
	ShutDown,
	/// Could not connect within the allowed attempts.
	Stopped,
	/// Schema check failed with enforcement on.
	Halted,
}

enum SessionEnd {
	Cancelled,
	Halted,
	/// `established` is set when the session got as far as `Running`.
	Lost {
		error: SchedulerError,
		established: bool,
	},
}

pub struct SchedulerLoop<C: Connector> {
	connector: C,
	agent: AgentConfig,
	alerts: AlertsConfig,
	pipeline: NotificationPipeline,
	state: LoopState,
}

impl<C: Connector> SchedulerLoop<C> {
	pub fn new(
		connector: C,
		agent: AgentConfig,
		alerts: AlertsConfig,
		relay: Option<Arc<dyn MailRelay>>,
	) -> Self {
		let pipeline = NotificationPipeline::from_config(&alerts, relay);
		Self {
			connector,
			agent,
			alerts,
			pipeline,
			state: LoopState::Connecting { attempt: 1 },
		}
	}

	pub fn state(&self) -> LoopState {
		self.state
	}

	#[instrument(skip_all, fields(station = %self.agent.station))]
	pub async fn run(mut self, cancel: &CancellationToken) -> LoopOutcome {
		let mut attempt = 0u32;

		loop {
			if cancel.is_cancelled() {
				return self.finish(LoopState::ShutDown).await;
			}

			attempt += 1;
			self.set_state(LoopState::Connecting { attempt });

			let end = match self.connector.connect().await {
				Ok((store, channel)) => self.run_session(store, channel, cancel).await,
				Err(e) => SessionEnd::Lost {
					error: e.into(),
					established: false,
				},
			};

			match end {
				SessionEnd::Cancelled => return self.finish(LoopState::ShutDown).await,
				SessionEnd::Halted => return self.finish(LoopState::Halted).await,
				SessionEnd::Lost {
					error,
					established: true,
				} => {
					warn!(error = %error, "database connection lost, reconnecting");
					attempt = 0;
				}
				SessionEnd::Lost {
					error,
					established: false,
				} => {
					if attempt >= self.agent.max_connect_attempts {
						error!(
							attempts = attempt,
							error = %error,
							"could not connect to the database, giving up"
						);
						return self.finish(LoopState::Stopped).await;
					}
					warn!(
						attempt,
						max_attempts = self.agent.max_connect_attempts,
						retry_in_secs = self.agent.reconnect_wait.as_secs(),
						error = %error,
						"could not connect to the database"
					);
				}
			}

			if !sleep_unless_cancelled(cancel, self.agent.reconnect_wait).await {
				return self.finish(LoopState::ShutDown).await;
			}
		}
	}

	async fn run_session(
		&mut self,
		store: Arc<C::Store>,
		mut channel: C::Channel,
		cancel: &CancellationToken,
	) -> SessionEnd {
		let degraded = match check_schema(store.as_ref()).await {
			Ok(()) => false,
			Err(e) if e.is_schema() => {
				error!(error = %e, "pgagent schema check failed");
				if self.agent.enforce_schema_version {
					return SessionEnd::Halted;
				}
				warn!("continuing without job dispatch until the schema is fixed");
				true
			}
			Err(e) => {
				return SessionEnd::Lost {
					error: e,
					established: false,
				}
			}
		};

		let mut dispatcher = None;
		if !degraded {
			let agent_id = match channel.register_agent(&self.agent.station).await {
				Ok(id) => id,
				Err(e) => {
					return SessionEnd::Lost {
						error: e.into(),
						established: false,
					}
				}
			};
			info!(agent_id, "agent registered");

			if let Err(e) = ZombieReaper::new(Arc::clone(&store)).reap(Utc::now()).await {
				warn!(error = %e, "zombie cleanup failed");
			}

			dispatcher = Some(JobDispatcher::new(
				Arc::clone(&store),
				Arc::new(StepExecutor::new(Arc::clone(&store))),
				agent_id,
				self.agent.station.clone(),
				self.agent.max_concurrent_jobs,
			));
		}

		let listener = NotificationListener::new(Arc::clone(&store), DetailCollector::from_config(&self.alerts));
		self.set_state(LoopState::Running);

		let end = loop {
			if cancel.is_cancelled() {
				break SessionEnd::Cancelled;
			}

			if let Err(e) = self.pipeline.drain(&listener, &mut channel, Utc::now()).await {
				break SessionEnd::Lost {
					error: e.into(),
					established: true,
				};
			}

			if let Some(dispatcher) = dispatcher.as_mut() {
				if let Err(e) = dispatcher.dispatch_due().await {
					warn!(error = %e, "failed to dispatch due jobs, skipping this cycle");
				}
			}

			if !sleep_unless_cancelled(cancel, self.agent.poll_interval).await {
				break SessionEnd::Cancelled;
			}
		};

		if let Some(mut dispatcher) = dispatcher {
			dispatcher.shutdown().await;
		}
		end
	}

	async fn finish(&mut self, state: LoopState) -> LoopOutcome {
		self.set_state(state);
		if let Some(outcome) = self.pipeline.flush_now(Utc::now()).await {
			info!(outcome = ?outcome, "flushed pending failure alerts");
		}

		match state {
			LoopState::Stopped => LoopOutcome::Stopped,
			LoopState::Halted => LoopOutcome::Halted,
			_ => LoopOutcome::ShutDown,
		}
	}

	fn set_state(&mut self, state: LoopState) {
		if self.state != state {
			debug!(from = ?self.state, to = ?state, "scheduler state change");
			self.state = state;
		}
	}
}

async fn check_schema<S: AgentStore + ?Sized>(store: &S) -> Result<()> {
	if !store.schema_present().await? {
		return Err(SchedulerError::SchemaMissing);
	}

	match store.schema_version().await? {
		Some(version) if version == SCHEMA_VERSION => Ok(()),
		found => Err(SchedulerError::SchemaVersion {
			found: found.map_or_else(|| "no version".to_string(), |v| v.to_string()),
			expected: SCHEMA_VERSION,
		}),
	}
}
