// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Build information for the `version` subcommand.

use pgagent_scheduler::SCHEMA_VERSION;

pub fn format_version_info() -> String {
	format!(
		"pgagent version: {}\n\
		 Schema version:  {}\n\
		 Git SHA:         {}\n\
		 Platform:        {}-{}",
		env!("CARGO_PKG_VERSION"),
		SCHEMA_VERSION,
		option_env!("PGAGENT_GIT_SHA").unwrap_or("unknown"),
		std::env::consts::OS,
		std::env::consts::ARCH,
	)
}
