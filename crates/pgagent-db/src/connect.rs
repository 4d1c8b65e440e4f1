// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use pgagent_config::DatabaseConfig;

use crate::agent::{AgentRepository, AgentStore};
use crate::channel::{PgStatusChannel, StatusChannel};
use crate::error::Result;
use crate::pool::create_pool;

/// Opens a fresh store and listening session.
#[async_trait]
pub trait Connector: Send + Sync {
	type Store: AgentStore + 'static;
	type Channel: StatusChannel + 'static;

	async fn connect(&self) -> Result<(Arc<Self::Store>, Self::Channel)>;
}

pub struct PgConnector {
	config: DatabaseConfig,
}

impl PgConnector {
	pub fn new(config: DatabaseConfig) -> Self {
		Self { config }
	}
}

#[async_trait]
impl Connector for PgConnector {
	type Store = AgentRepository;
	type Channel = PgStatusChannel;

	async fn connect(&self) -> Result<(Arc<AgentRepository>, PgStatusChannel)> {
		let pool = create_pool(&self.config).await?;
		let channel =
			PgStatusChannel::connect(&pool, &self.config.channel, self.config.drain_timeout).await?;
		let store = AgentRepository::new(pool, self.config.channel.clone());
		Ok((Arc::new(store), channel))
	}
}
