// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pgagent_db::{AgentStore, ReapReport};
use tracing::{debug, instrument, warn};

use crate::error::Result;

/// Cleans up after agents whose database sessions have gone away.
pub struct ZombieReaper<S: AgentStore + ?Sized> {
	store: Arc<S>,
}

impl<S: AgentStore + ?Sized> ZombieReaper<S> {
	pub fn new(store: Arc<S>) -> Self {
		Self { store }
	}

	/// Abort the runs of dead agents and release their jobs. A failure
	/// event naming the aborted jobs is published in the same transaction.
	#[instrument(skip(self))]
	pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport> {
		let report = self.store.reap_zombies(now).await?;

		if report.is_empty() {
			debug!("no zombie agents found");
		} else {
			warn!(
				dead_agents = ?report.dead_agents,
				aborted_jobs = ?report.aborted_jobs,
				"cleaned up after dead agents"
			);
		}
		Ok(report)
	}
}
