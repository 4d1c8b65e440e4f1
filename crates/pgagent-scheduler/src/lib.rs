// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scheduler loop for the pgagent job agent.
//!
//! [`SchedulerLoop`] owns the database session: it checks the catalog,
//! registers the agent, runs [`ZombieReaper`], then alternates between
//! draining status notifications and handing due jobs to [`JobDispatcher`].

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod reaper;
pub mod scheduler;
pub mod worker;

pub use context::{sleep_unless_cancelled, CancellationToken};
pub use dispatcher::{DispatchSummary, JobDispatcher};
pub use error::{Result, SchedulerError};
pub use executor::{JobExecutor, JobOutcome, StepExecutor};
pub use reaper::ZombieReaper;
pub use scheduler::{LoopOutcome, LoopState, SchedulerLoop, SCHEMA_VERSION};
pub use worker::run_job;
