// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use pgagent_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("database error: {0}")]
	Database(#[from] DbError),

	#[error("pgagent schema not found in the database")]
	SchemaMissing,

	#[error("pgagent schema version mismatch: database has {found}, agent requires {expected}")]
	SchemaVersion { found: String, expected: i16 },
}

impl SchedulerError {
	/// Errors that describe the database contents rather than the connection.
	pub fn is_schema(&self) -> bool {
		matches!(
			self,
			SchedulerError::SchemaMissing | SchedulerError::SchemaVersion { .. }
		)
	}
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
