// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::str::FromStr;

use pgagent_config::DatabaseConfig;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::error::DbError;

/// Create a PgPool for the agent.
///
/// The pool keeps no minimum; connections idle for longer than
/// `config.idle_timeout` are closed, so a quiet agent holds only its
/// listening connection.
///
/// # Errors
/// Returns `DbError::Internal` if the URL is invalid, or the driver error if
/// the first connection cannot be established.
#[tracing::instrument(skip(config))]
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DbError> {
	let options = PgConnectOptions::from_str(&config.url)
		.map_err(|e| DbError::Internal(format!("Invalid database URL: {e}")))?
		.application_name("pgagent");

	let pool = PgPoolOptions::new()
		.max_connections(config.max_connections)
		.min_connections(0)
		.idle_timeout(Some(config.idle_timeout))
		.connect_with(options)
		.await?;

	tracing::debug!("database pool created");
	Ok(pool)
}
