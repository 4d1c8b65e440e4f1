// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! PostgreSQL access for the pgagent scheduler.
//!
//! [`AgentStore`] covers the catalog queries and bookkeeping writes,
//! [`StatusChannel`] the LISTEN session that carries [`JobStatusEvent`]s, and
//! [`Connector`] opens both together.

pub mod agent;
pub mod channel;
pub mod connect;
pub mod error;
pub mod event;
pub mod pool;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{abort_event, AgentRepository, AgentStore};
pub use channel::{PgStatusChannel, StatusChannel, MAX_DRAIN_BATCH};
pub use connect::{Connector, PgConnector};
pub use error::{DbError, Result};
pub use event::{
	parse_timestamp, truncate_text, ChannelFlags, DecodeError, JobStatus, JobStatusEvent,
	FILE_TIMESTAMP_FORMAT, MAX_DESCRIPTION_BYTES, MAX_PAYLOAD_BYTES, TIMESTAMP_FORMAT,
};
pub use pool::create_pool;
pub use types::{
	ClaimedRun, JobStep, NotificationSettingsRow, OnError, ReapReport, StepKind, StepOutcome,
	StepStatus,
};
