//! Incremental build/query driver
//!
//! A target moves through [`TargetState`]: its expanded query is hashed and
//! compared against `jobs.json`, re-run remotely only when the hash changed,
//! and its output is downloaded only when the local copy fails verification.
//! A download happens at most once per invocation; rerunning the driver is the
//! retry mechanism.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use md5::{Digest, Md5};
use tracing::{debug, error, info, warn};

use crate::config::{Layout, PreparedQuery, StudyConfig};
use crate::error::{ServiceResult, StudyError, StudyResult};
use crate::jobs::{JobCache, JobEntry, OutputChecksum};
use crate::service::{JobReport, QueryService, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
	NeedsRun,
	Running,
	Downloading,
	Verified,
	/// Terminal failure with the process exit code
	Failed(i32),
}

impl fmt::Display for TargetState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TargetState::NeedsRun => write!(f, "needs-run"),
			TargetState::Running => write!(f, "running"),
			TargetState::Downloading => write!(f, "downloading"),
			TargetState::Verified => write!(f, "verified"),
			TargetState::Failed(code) => write!(f, "failed({code})"),
		}
	}
}

/// Drives targets of one study against one service session.
pub struct Driver<'a, S: QueryService> {
	layout: &'a Layout,
	config: &'a StudyConfig,
	jobs: &'a mut JobCache,
	service: S,
	state: TargetState,
}

impl<'a, S: QueryService> Driver<'a, S> {
	pub fn new(layout: &'a Layout, config: &'a StudyConfig, jobs: &'a mut JobCache, service: S) -> Self {
		Self {
			layout,
			config,
			jobs,
			service,
			state: TargetState::NeedsRun,
		}
	}

	pub fn state(&self) -> TargetState {
		self.state
	}

	pub fn into_service(self) -> S {
		self.service
	}

	fn transition(&mut self, target: &str, next: TargetState) {
		debug!("Driver: {target}: {} -> {next}", self.state);
		self.state = next;
	}

	/// Bring a target's local output up to date.
	pub fn build(&mut self, target: &str) -> StudyResult<TargetState> {
		self.state = TargetState::NeedsRun;
		match self.try_build(target) {
			Ok(state) => Ok(state),
			Err(e) => {
				self.transition(target, TargetState::Failed(e.exit_code()));
				Err(e)
			}
		}
	}

	fn try_build(&mut self, target: &str) -> StudyResult<TargetState> {
		if let Some(prepared) = self.needs_run(target)? {
			self.transition(target, TargetState::Running);
			self.run_query(&prepared)?;
		}

		if self.verify(target)? {
			self.transition(target, TargetState::Verified);
			return Ok(self.state);
		}

		self.transition(target, TargetState::Downloading);
		self.download(target)?;
		if self.verify(target)? {
			self.transition(target, TargetState::Verified);
			Ok(self.state)
		} else {
			Err(StudyError::NotVerified {
				path: self.layout.target_output(target),
			})
		}
	}

	/// The prepared query when the stored hash is missing or differs.
	pub fn needs_run(&self, target: &str) -> StudyResult<Option<PreparedQuery>> {
		let prepared = self.config.prepare_query(target, self.layout)?;
		Ok(self
			.jobs
			.is_run_needed(target, &prepared.sha256)
			.then_some(prepared))
	}

	/// Submit a prepared query, record the job and drop the stale output.
	pub fn run_query(&mut self, prepared: &PreparedQuery) -> StudyResult<JobEntry> {
		info!("Driver: running query for {}", prepared.target);
		let job = self.service.submit(&prepared.text, &prepared.dataset)?;
		debug!("Driver: job {job} is running");
		let report = self.service.wait(job)?;
		debug!("Driver: job {job} is complete");
		check_report(&report)?;

		let entry = JobEntry {
			job,
			sha256: prepared.sha256.clone(),
			output_size: report.output_size,
			output_checksum: report.output_checksum.clone(),
			config_hash: Some(self.config.config_hash(&prepared.target)?),
		};
		self.jobs.insert(prepared.target.clone(), entry.clone());
		self.jobs.save()?;

		remove_if_exists(&self.layout.target_output(&prepared.target))?;
		Ok(entry)
	}

	/// Download a target's recorded job output, applying its visibility first.
	pub fn download(&mut self, target: &str) -> StudyResult<u64> {
		info!("Driver: downloading query output \"{target}\"");
		let job = self.recorded_job(target)?.job;
		let public = self.config.query(target)?.make_public;
		self.service.set_public(job, public)?;

		download_to(&mut self.service, job, &self.layout.target_output(target))
	}

	/// Check the local output against the size and checksum of its job.
	///
	/// A mismatching file is deleted. A matching file has its modification
	/// time refreshed.
	pub fn verify(&mut self, target: &str) -> StudyResult<bool> {
		let path = self.layout.target_output(target);
		if !path.exists() {
			return Ok(false);
		}
		let (size, checksum) = self.expected_output(target)?;

		let actual = fs::metadata(&path)?.len();
		if let Some(expected) = size {
			if actual != expected {
				warn!(
					"Driver: output of {target} is {actual} bytes, should be {expected}, deleting"
				);
				fs::remove_file(&path)?;
				return Ok(false);
			}
		}

		if let Some(checksum) = checksum {
			if md5_prefix(&path, checksum.span)? != checksum.md5 {
				warn!("Driver: output of {target} has bad hash, deleting");
				fs::remove_file(&path)?;
				return Ok(false);
			}
		}

		File::options()
			.write(true)
			.open(&path)?
			.set_modified(SystemTime::now())?;
		Ok(true)
	}

	fn recorded_job(&self, target: &str) -> StudyResult<&JobEntry> {
		self.jobs
			.get(target)
			.ok_or_else(|| StudyError::Config(format!("No job recorded for target '{target}'")))
	}

	/// Expected size and checksum, from `jobs.json` or else the service.
	fn expected_output(&mut self, target: &str) -> StudyResult<(Option<u64>, Option<OutputChecksum>)> {
		let entry = self.recorded_job(target)?.clone();
		if entry.output_size.is_some() && entry.output_checksum.is_some() {
			return Ok((entry.output_size, entry.output_checksum));
		}
		let report = self.service.job(entry.job)?;
		Ok((report.output_size, report.output_checksum))
	}
}

/// Fail with the matching error when the service reported one.
pub fn check_report(report: &JobReport) -> StudyResult<()> {
	if report.compiler_status == Status::Error {
		error!("Job {} had a compilation error.", report.id);
		for e in &report.compiler_errors {
			error!("{e}");
		}
		return Err(StudyError::Compilation {
			job: report.id,
			errors: report.compiler_errors.clone(),
		});
	}
	if report.exec_status == Status::Error {
		error!("Job {} had an execution error.", report.id);
		error!("See url: {}", report.url);
		return Err(StudyError::Execution {
			job: report.id,
			url: report.url.clone(),
		});
	}
	Ok(())
}

/// Run a query file once and save its output, without touching `jobs.json`.
pub fn run_adhoc<S: QueryService>(
	service: &mut S,
	query: &str,
	dataset: &str,
	output: &Path,
) -> StudyResult<JobReport> {
	let job = service.submit(query, dataset)?;
	debug!("Driver: job {job} is running");
	let started = std::time::Instant::now();
	let report = service.wait(job)?;
	debug!("Driver: job {job} is complete after {:?}", started.elapsed());
	check_report(&report)?;

	info!("Driver: downloading query output \"{}\"", output.display());
	download_to(service, job, output)?;
	Ok(report)
}

fn download_to<S: QueryService>(service: &mut S, job: u64, path: &Path) -> StudyResult<u64> {
	let write = |service: &mut S| -> ServiceResult<u64> {
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir)?;
		}
		let mut out = BufWriter::new(File::create(path)?);
		let written = service.download(job, &mut out)?;
		out.flush()?;
		Ok(written)
	};
	match write(service) {
		Ok(written) => {
			debug!("Driver: wrote {written} bytes to {}", path.display());
			Ok(written)
		}
		Err(source) => {
			error!("Driver: download of job {job} failed: {source}");
			if let Err(e) = remove_if_exists(path) {
				warn!("Driver: could not remove {}: {}", path.display(), e);
			}
			Err(StudyError::DownloadWrite {
				job,
				path: path.to_path_buf(),
				source,
			})
		}
	}
}

/// md5 hex digest of the first `span` bytes of a file.
pub fn md5_prefix(path: &Path, span: u64) -> io::Result<String> {
	let mut hasher = Md5::new();
	io::copy(&mut File::open(path)?.take(span), &mut hasher)?;
	Ok(hex::encode(hasher.finalize()))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
	match fs::remove_file(path) {
		Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
		_ => Ok(()),
	}
}

/// Clean every recorded target whose configuration block changed.
///
/// Local outputs of changed targets are removed and the new configuration
/// digest is recorded. Returns the changed targets.
pub fn check_config(layout: &Layout, config: &StudyConfig, jobs: &mut JobCache) -> StudyResult<Vec<String>> {
	let targets: Vec<String> = jobs.targets().map(str::to_string).collect();
	let mut changed = Vec::new();

	for target in targets {
		let new_hash = config.config_hash(&target).ok();
		let Some(entry) = jobs.get_mut(&target) else {
			continue;
		};
		if new_hash.is_some() && entry.config_hash == new_hash {
			continue;
		}
		info!("Driver: config changed for {target}, cleaning outputs");
		for path in target_outputs(layout, config, &target) {
			remove_if_exists(&path)?;
		}
		if new_hash.is_some() {
			entry.config_hash = new_hash;
		}
		changed.push(target);
	}

	if !changed.is_empty() {
		jobs.save()?;
	}
	Ok(changed)
}

/// Local files derived from a target.
pub fn target_outputs(layout: &Layout, config: &StudyConfig, target: &str) -> Vec<PathBuf> {
	let mut outputs = vec![layout.target_output(target)];
	if let Ok(query) = config.query(target) {
		if let Some(csv) = &query.csv {
			outputs.push(layout.csv_root().join(&csv.output));
		}
		if let Some(dupes) = &query.gendupes {
			outputs.push(layout.txt_root().join(&dupes.output));
			if let Some(csv) = &dupes.csv {
				outputs.push(layout.csv_root().join(csv));
			}
		}
	}
	outputs
}
