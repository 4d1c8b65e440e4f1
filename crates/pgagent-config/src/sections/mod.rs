// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod agent;
mod alerts;
mod database;
mod logging;
mod smtp;

pub use agent::{AgentConfig, AgentConfigLayer};
pub use alerts::{AlertsConfig, AlertsConfigLayer};
pub use database::{
	DatabaseConfig, DatabaseConfigLayer, DEFAULT_DATABASE_URL, DEFAULT_STATUS_CHANNEL,
};
pub use logging::{LoggingConfig, LoggingConfigLayer};
pub use smtp::{SmtpConfig, SmtpConfigLayer, TlsMode, DEFAULT_SMTP_HOST, DEFAULT_SMTP_PORT};
