// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-effort diagnostics for a failing job.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use pgagent_config::AlertsConfig;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

const MEMINFO_KEYS: [&str; 3] = ["MemTotal:", "MemFree:", "MemAvailable:"];

/// How much of the end of the application log is searched.
const APPLICATION_LOG_WINDOW: u64 = 64 * 1024;

/// Where host resource figures are read from.
#[derive(Debug, Clone)]
pub struct HostProbe {
	pub meminfo: PathBuf,
	pub loadavg: PathBuf,
}

impl HostProbe {
	pub fn from_config(config: &AlertsConfig) -> Self {
		Self {
			meminfo: config.meminfo_path.clone(),
			loadavg: config.loadavg_path.clone(),
		}
	}

	/// Memory lines and load average, one per line. Unreadable sources are
	/// noted inline.
	pub async fn snapshot(&self) -> String {
		let mut out = String::new();

		match tokio::fs::read_to_string(&self.meminfo).await {
			Ok(meminfo) => {
				for line in meminfo
					.lines()
					.filter(|l| MEMINFO_KEYS.iter().any(|k| l.starts_with(k)))
				{
					out.push_str(line);
					out.push('\n');
				}
			}
			Err(e) => {
				out.push_str(&format!(
					"Memory information unavailable ({}: {e})\n",
					self.meminfo.display()
				));
			}
		}

		match tokio::fs::read_to_string(&self.loadavg).await {
			Ok(loadavg) => {
				out.push_str(&format!("Load Average: {}\n", loadavg.trim()));
			}
			Err(e) => {
				out.push_str(&format!(
					"Load average unavailable ({}: {e})\n",
					self.loadavg.display()
				));
			}
		}

		out
	}
}

#[derive(Debug, Clone)]
pub struct DetailCollector {
	host: HostProbe,
	job_log_dir: PathBuf,
	application_log: PathBuf,
	tail_lines: usize,
}

impl DetailCollector {
	pub fn new(
		host: HostProbe,
		job_log_dir: impl Into<PathBuf>,
		application_log: impl Into<PathBuf>,
		tail_lines: usize,
	) -> Self {
		Self {
			host,
			job_log_dir: job_log_dir.into(),
			application_log: application_log.into(),
			tail_lines,
		}
	}

	pub fn from_config(config: &AlertsConfig) -> Self {
		Self::new(
			HostProbe::from_config(config),
			&config.job_log_dir,
			&config.application_log,
			config.application_log_tail_lines,
		)
	}

	/// Never fails: every missing source is described in the returned text.
	#[tracing::instrument(skip(self))]
	pub async fn collect(&self, job_id: &str) -> String {
		let mut out = String::from("System Information:\n");
		out.push_str(&self.host.snapshot().await);

		out.push_str("\nJob Specific Logs:\n");
		out.push_str(&self.job_log(job_id).await);

		out.push_str("\nRecent Application Logs:\n");
		out.push_str(&self.application_log_lines(job_id).await);

		debug!(bytes = out.len(), "collected failure details");
		out
	}

	async fn job_log(&self, job_id: &str) -> String {
		if !is_safe_file_stem(job_id) {
			return format!("Job id '{job_id}' cannot be used as a log file name\n");
		}

		let path = self.job_log_dir.join(format!("{job_id}.log"));
		match tokio::fs::read_to_string(&path).await {
			Ok(contents) => {
				let mut text = contents;
				if !text.ends_with('\n') {
					text.push('\n');
				}
				text
			}
			Err(_) => format!("No job-specific log file found at {}\n", path.display()),
		}
	}

	async fn application_log_lines(&self, job_id: &str) -> String {
		let contents = match read_tail(&self.application_log, APPLICATION_LOG_WINDOW).await {
			Ok(contents) => contents,
			Err(e) => {
				return format!(
					"Application log {} not readable: {e}\n",
					self.application_log.display()
				)
			}
		};

		let lines = tail_mentions(&contents, job_id, self.tail_lines);
		if lines.is_empty() {
			return format!(
				"No entries for job {job_id} in the last {} lines of {}\n",
				self.tail_lines,
				self.application_log.display()
			);
		}

		let mut out = lines.join("\n");
		out.push('\n');
		out
	}
}

/// The last `window` bytes of `path`, decoded lossily. When the window starts
/// mid-file the partial first line is dropped.
async fn read_tail(path: &Path, window: u64) -> std::io::Result<String> {
	let mut file = tokio::fs::File::open(path).await?;
	let len = file.metadata().await?.len();
	let start = len.saturating_sub(window);
	file.seek(SeekFrom::Start(start)).await?;

	let mut bytes = Vec::with_capacity(usize::try_from(len - start).unwrap_or(0));
	file.take(window).read_to_end(&mut bytes).await?;
	let text = String::from_utf8_lossy(&bytes);

	if start == 0 {
		return Ok(text.into_owned());
	}
	Ok(match text.find('\n') {
		Some(end) => text[end + 1..].to_string(),
		None => String::new(),
	})
}

/// Lines among the last `tail` lines of `contents` that mention `needle`.
fn tail_mentions<'a>(contents: &'a str, needle: &str, tail: usize) -> Vec<&'a str> {
	let lines: Vec<&str> = contents.lines().collect();
	let start = lines.len().saturating_sub(tail);
	lines[start..]
		.iter()
		.copied()
		.filter(|l| l.contains(needle))
		.collect()
}

fn is_safe_file_stem(value: &str) -> bool {
	!value.is_empty()
		&& value
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Convenience for paths shown in reports.
pub(crate) fn display_name(path: &Path) -> String {
	path.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	fn collector(dir: &Path) -> DetailCollector {
		DetailCollector::new(
			HostProbe {
				meminfo: dir.join("meminfo"),
				loadavg: dir.join("loadavg"),
			},
			dir.join("jobs"),
			dir.join("application.log"),
			3,
		)
	}

	#[test]
	fn tail_only_looks_at_the_last_lines() {
		let log = "job 7 early\nnoise\njob 7 late\nother\njob 70 too";
		assert_eq!(tail_mentions(log, "7", 3), vec!["job 7 late", "job 70 too"]);
	}

	#[test]
	fn rejects_path_like_job_ids() {
		assert!(is_safe_file_stem("42"));
		assert!(is_safe_file_stem("nightly-backup_2"));
		assert!(!is_safe_file_stem("../etc/passwd"));
		assert!(!is_safe_file_stem(""));
	}

	#[tokio::test]
	async fn collects_every_available_source() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(
			dir.path().join("meminfo"),
			"MemTotal: 100 kB\nMemFree: 50 kB\nBuffers: 1 kB\nMemAvailable: 70 kB\n",
		)
		.unwrap();
		fs::write(dir.path().join("loadavg"), "0.10 0.20 0.30 1/100 4242\n").unwrap();
		fs::create_dir(dir.path().join("jobs")).unwrap();
		fs::write(dir.path().join("jobs/42.log"), "step 1 exploded").unwrap();
		fs::write(
			dir.path().join("application.log"),
			"42 old\na\nb\nretrying job 42\n",
		)
		.unwrap();

		let details = collector(dir.path()).collect("42").await;

		assert!(details.contains("MemTotal: 100 kB"));
		assert!(details.contains("MemAvailable: 70 kB"));
		assert!(!details.contains("Buffers"));
		assert!(details.contains("Load Average: 0.10 0.20 0.30 1/100 4242"));
		assert!(details.contains("step 1 exploded"));
		assert!(details.contains("retrying job 42"));
		assert!(!details.contains("42 old"));
	}

	#[tokio::test]
	async fn invalid_utf8_in_the_application_log_is_tolerated() {
		let dir = tempfile::tempdir().unwrap();
		let mut log = b"boot \xff\xfe garbage\n".to_vec();
		log.extend_from_slice(b"job 42 failed again\n");
		fs::write(dir.path().join("application.log"), log).unwrap();

		let details = collector(dir.path()).collect("42").await;

		assert!(details.contains("job 42 failed again"));
		assert!(!details.contains("not readable"));
	}

	#[tokio::test]
	async fn only_the_end_of_a_large_log_is_read() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("application.log");
		let mut log = String::from("job 42 ancient\n");
		log.push_str(&"y".repeat(APPLICATION_LOG_WINDOW as usize));
		log.push_str("\njob 42 recent\n");
		fs::write(&path, &log).unwrap();

		let tail = read_tail(&path, APPLICATION_LOG_WINDOW).await.unwrap();

		assert!(tail.len() as u64 <= APPLICATION_LOG_WINDOW);
		assert_eq!(tail, "job 42 recent\n");
	}

	#[tokio::test]
	async fn missing_sources_are_noted_not_fatal() {
		let dir = tempfile::tempdir().unwrap();
		let details = collector(dir.path()).collect("5").await;

		assert!(details.starts_with("System Information:\n"));
		assert!(details.contains("Memory information unavailable"));
		assert!(details.contains("No job-specific log file found at"));
		assert!(details.contains("not readable"));
	}
}
