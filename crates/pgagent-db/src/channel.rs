// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The LISTEN side of the status channel.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use crate::error::{DbError, Result};

/// Most payloads handed out by one drain; the rest wait for the next call.
pub const MAX_DRAIN_BATCH: usize = 1000;

#[async_trait]
pub trait StatusChannel: Send {
	/// Register this agent under `station` on the listening session and
	/// return its id (the session's backend pid).
	async fn register_agent(&mut self, station: &str) -> Result<i32>;

	/// Take pending payloads, up to [`MAX_DRAIN_BATCH`], without waiting for
	/// new ones.
	///
	/// Payloads received before the session dropped are returned first; the
	/// loss is reported as [`DbError::ConnectionLost`] (or the underlying
	/// error) by the next call.
	async fn drain(&mut self) -> Result<Vec<String>>;
}

/// Dedicated listening session. The agent registration lives on this
/// session, so the registration dies with it.
pub struct PgStatusChannel {
	listener: PgListener,
	drain_timeout: Duration,
	lost: Option<DbError>,
}

impl PgStatusChannel {
	#[tracing::instrument(skip(pool, drain_timeout))]
	pub async fn connect(pool: &PgPool, channel: &str, drain_timeout: Duration) -> Result<Self> {
		let mut listener = PgListener::connect_with(pool).await?;
		listener.listen(channel).await?;
		tracing::debug!(channel, "listening for job status events");

		Ok(Self {
			listener,
			drain_timeout,
			lost: None,
		})
	}
}

#[async_trait]
impl StatusChannel for PgStatusChannel {
	#[tracing::instrument(skip(self))]
	async fn register_agent(&mut self, station: &str) -> Result<i32> {
		let pid: i32 = sqlx::query_scalar(
			r#"
			INSERT INTO pgagent.pga_jobagent (jagpid, jagstation)
			SELECT pg_backend_pid(), $1
			RETURNING jagpid
			"#,
		)
		.bind(station)
		.fetch_one(&mut self.listener)
		.await?;

		Ok(pid)
	}

	async fn drain(&mut self) -> Result<Vec<String>> {
		if let Some(e) = self.lost.take() {
			return Err(e);
		}

		let mut payloads = Vec::new();
		while payloads.len() < MAX_DRAIN_BATCH {
			let lost = match tokio::time::timeout(self.drain_timeout, self.listener.try_recv()).await {
				Err(_) => break,
				Ok(Ok(Some(notification))) => {
					payloads.push(notification.payload().to_string());
					continue;
				}
				Ok(Ok(None)) => DbError::ConnectionLost,
				Ok(Err(e)) => e.into(),
			};

			if payloads.is_empty() {
				return Err(lost);
			}
			tracing::warn!(
				received = payloads.len(),
				error = %lost,
				"listening session dropped mid-drain"
			);
			self.lost = Some(lost);
			break;
		}
		Ok(payloads)
	}
}
