// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` is cancelled first. Returns `false`
/// when the sleep was cut short.
pub async fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
	tokio::select! {
		_ = tokio::time::sleep(duration) => !token.is_cancelled(),
		_ = token.cancelled() => false,
	}
}
