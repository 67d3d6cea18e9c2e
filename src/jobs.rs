//! Persisted record of remote jobs (`jobs.json`)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StudyResult;
use crate::store::atomic_write;

pub const JOBS_SCHEMA: &str = "schemas/0.1.0/jobs.schema.json";

/// Byte span and md5 digest the service computed over a job's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChecksum {
	pub span: u64,
	pub md5: String,
}

/// What is known about the last successful run of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
	pub job: u64,
	pub sha256: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output_size: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output_checksum: Option<OutputChecksum>,
	#[serde(rename = "config-hash", default, skip_serializing_if = "Option::is_none")]
	pub config_hash: Option<String>,
}

impl JobEntry {
	pub fn new(job: u64, sha256: impl Into<String>) -> Self {
		Self {
			job,
			sha256: sha256.into(),
			output_size: None,
			output_checksum: None,
			config_hash: None,
		}
	}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
	#[serde(rename = "$schema", default = "default_schema")]
	schema: String,
	#[serde(flatten)]
	entries: BTreeMap<String, JobEntry>,
}

fn default_schema() -> String {
	JOBS_SCHEMA.to_string()
}

/// Target name -> job entry, backed by `jobs.json`.
///
/// The file is kept read-only between saves so hand edits are deliberate.
#[derive(Debug)]
pub struct JobCache {
	path: PathBuf,
	entries: BTreeMap<String, JobEntry>,
}

impl JobCache {
	/// Open the cache at `path`; a missing or unreadable file is an empty cache.
	pub fn load(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		let entries = match fs::read(&path) {
			Ok(bytes) => match serde_json::from_slice::<JobsFile>(&bytes) {
				Ok(file) => file.entries,
				Err(e) => {
					warn!("Jobs: ignoring unreadable {}: {}", path.display(), e);
					BTreeMap::new()
				}
			},
			Err(_) => BTreeMap::new(),
		};
		debug!("Jobs: {} entries from {}", entries.len(), path.display());
		Self { path, entries }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn get(&self, target: &str) -> Option<&JobEntry> {
		self.entries.get(target)
	}

	pub fn get_mut(&mut self, target: &str) -> Option<&mut JobEntry> {
		self.entries.get_mut(target)
	}

	pub fn targets(&self) -> impl Iterator<Item = &str> {
		self.entries.keys().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn insert(&mut self, target: impl Into<String>, entry: JobEntry) -> Option<JobEntry> {
		self.entries.insert(target.into(), entry)
	}

	/// True when no entry exists or its hash differs from `sha256`.
	pub fn is_run_needed(&self, target: &str, sha256: &str) -> bool {
		match self.entries.get(target) {
			Some(entry) if entry.sha256 == sha256 => false,
			Some(_) => {
				debug!("Jobs: {target} hash changed");
				true
			}
			None => {
				debug!("Jobs: {target} has never run");
				true
			}
		}
	}

	/// Write the cache and leave the file read-only.
	pub fn save(&self) -> StudyResult<()> {
		if self.path.exists() {
			set_writable(&self.path, true)?;
		}
		let file = JobsFile {
			schema: JOBS_SCHEMA.to_string(),
			entries: self.entries.clone(),
		};
		let mut bytes = serde_json::to_vec_pretty(&file)?;
		bytes.push(b'\n');
		atomic_write(&self.path, &bytes)?;
		set_writable(&self.path, false)?;
		debug!("Jobs: saved {} entries", self.entries.len());
		Ok(())
	}
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	let mode = if writable { 0o644 } else { 0o444 };
	fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> std::io::Result<()> {
	let mut perms = fs::metadata(path)?.permissions();
	perms.set_readonly(!writable);
	fs::set_permissions(path, perms)
}
