// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Connection to the database was lost")]
	ConnectionLost,

	#[error("Invalid job id: {0}")]
	InvalidJobId(String),

	#[error("Internal: {0}")]
	Internal(String),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Job ids travel as strings; the catalog keys them as `int4`.
pub(crate) fn parse_job_id(job_id: &str) -> Result<i32> {
	job_id
		.trim()
		.parse()
		.map_err(|_| DbError::InvalidJobId(job_id.to_string()))
}
