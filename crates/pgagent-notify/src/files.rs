// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Write `contents` to `<stem>_<stamp>.<extension>` in `dir`, adding a
/// numeric suffix until the name is unused. Existing files are never
/// overwritten.
pub(crate) async fn create_unique(
	dir: &Path,
	stem: &str,
	stamp: &str,
	extension: &str,
	contents: &[u8],
) -> std::io::Result<PathBuf> {
	let mut suffix = 0u32;
	loop {
		let name = if suffix == 0 {
			format!("{stem}_{stamp}.{extension}")
		} else {
			format!("{stem}_{stamp}_{suffix}.{extension}")
		};
		let path = dir.join(name);

		match tokio::fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&path)
			.await
		{
			Ok(mut file) => {
				file.write_all(contents).await?;
				file.flush().await?;
				return Ok(path);
			}
			Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
			Err(e) => return Err(e),
		}
	}
}
