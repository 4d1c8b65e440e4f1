// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! pgagent job agent binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pgagent_db::PgConnector;
use pgagent_scheduler::{CancellationToken, LoopOutcome, SchedulerLoop};
use pgagent_smtp::{MailRelay, SmtpClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod version;

/// pgagent - runs scheduled PostgreSQL jobs and reports their status.
#[derive(Parser, Debug)]
#[command(name = "pgagent", about = "PostgreSQL job agent", version)]
struct Args {
	/// Configuration file (default: /etc/pgagent/pgagent.toml)
	#[arg(short, long, env = "PGAGENT_CONFIG")]
	config: Option<PathBuf>,

	/// Database connection string, overriding the configuration
	#[arg(long, env = "PGAGENT_DATABASE_URL")]
	database_url: Option<String>,

	/// Log filter, overriding the configuration (RUST_LOG still wins)
	#[arg(long)]
	log_level: Option<String>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version and build information
	Version,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("{}", version::format_version_info());
		return Ok(ExitCode::SUCCESS);
	}

	dotenvy::dotenv().ok();

	let mut config = match &args.config {
		Some(path) => pgagent_config::load_config_with_file(path)?,
		None => pgagent_config::load_config()?,
	};
	if let Some(url) = args.database_url {
		config.database.url = url;
	}
	if let Some(level) = args.log_level {
		config.logging.level = level;
	}

	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| config.logging.level.clone().into());
	if config.logging.json {
		tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer().json())
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer())
			.init();
	}

	tracing::info!(
		station = %config.agent.station,
		channel = %config.database.channel,
		"starting pgagent"
	);

	let relay: Option<Arc<dyn MailRelay>> = match &config.smtp {
		Some(smtp) => match SmtpClient::new(smtp, config.alerts.send_timeout) {
			Ok(client) => Some(Arc::new(client)),
			Err(e) => {
				tracing::error!(error = %e, "invalid mail relay settings, alerts will be saved locally");
				None
			}
		},
		None => None,
	};

	let cancel = CancellationToken::new();
	tokio::spawn(shutdown_signal(cancel.clone()));

	let scheduler = SchedulerLoop::new(
		PgConnector::new(config.database.clone()),
		config.agent.clone(),
		config.alerts.clone(),
		relay,
	);

	let outcome = scheduler.run(&cancel).await;
	tracing::info!(outcome = ?outcome, "pgagent stopped");

	Ok(match outcome {
		LoopOutcome::ShutDown => ExitCode::SUCCESS,
		LoopOutcome::Stopped | LoopOutcome::Halted => ExitCode::FAILURE,
	})
}

async fn shutdown_signal(cancel: CancellationToken) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
			}
			Err(e) => {
				tracing::warn!(error = %e, "cannot listen for SIGTERM");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}

	tracing::info!("received shutdown signal");
	cancel.cancel();
}
