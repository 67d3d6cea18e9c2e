//! Error types for the study pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type covering every failure mode of the pipeline.
///
/// Variants are grouped by how the operator is expected to react to them:
///
/// ### Configuration errors
/// Missing or unparseable `study-config.json`, unknown targets, unknown
/// dataset aliases, bad substitution rules or missing snippet files. These are
/// fatal and never retried.
///
/// ### Remote execution errors
/// Compilation or execution failures reported by the mining service. Fatal for
/// the target; the diagnostics are logged before the error surfaces.
///
/// ### Transfer integrity errors
/// A failed write while downloading, or a downloaded artifact that does not
/// match the size and checksum reported by the service. The bad file is always
/// deleted before the error is returned.
///
/// ### Cache errors
/// Columnar cache problems. Reads that fail are recovered locally by the
/// loader; only write failures reach callers.
///
/// Every variant maps to a process exit code via [`StudyError::exit_code`], so
/// the CLI can terminate with a category-specific status.
#[derive(Debug, Error)]
pub enum StudyError {
	/// File system I/O errors
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// Polars DataFrame operation errors during data processing
	#[error("Polars error: {0}")]
	Polars(#[from] polars::error::PolarsError),

	/// Study configuration could not be read or is invalid
	#[error("Configuration error: {0}")]
	Config(String),

	/// The configuration does not define the requested target
	#[error("Unknown target '{0}'")]
	UnknownTarget(String),

	/// A query names a dataset alias the configuration does not define
	#[error("Dataset named '{0}' is not known")]
	UnknownDataset(String),

	/// A snippet file referenced by a substitution rule is missing
	#[error("Snippet file '{file}' not found for substitution '{target}'")]
	MissingSnippet { target: String, file: PathBuf },

	/// The service reported a compilation error for a job
	#[error("Job {job} had a compilation error")]
	Compilation { job: u64, errors: Vec<String> },

	/// The service reported an execution error for a job
	#[error("Job {job} had an execution error (see {url})")]
	Execution { job: u64, url: String },

	/// Writing the downloaded output failed; the partial file was removed
	#[error("Failed to write output of job {job} to {path}: {source}")]
	DownloadWrite {
		job: u64,
		path: PathBuf,
		#[source]
		source: ServiceError,
	},

	/// A freshly downloaded file failed size/checksum verification
	#[error("Downloaded output {path} failed verification")]
	NotVerified { path: PathBuf },

	/// Text-to-CSV conversion errors
	#[error("Conversion error: {0}")]
	Convert(#[from] ConvertError),

	/// Cache-related errors
	#[error("Cache error: {0}")]
	Cache(#[from] CacheError),

	/// Remote service errors outside of the categorized job failures
	#[error("Service error: {0}")]
	Service(#[from] ServiceError),

	/// JSON (de)serialization errors
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl StudyError {
	/// Process exit status for this error category.
	pub fn exit_code(&self) -> i32 {
		match self {
			StudyError::Config(_)
			| StudyError::UnknownTarget(_)
			| StudyError::MissingSnippet { .. } => 10,
			StudyError::UnknownDataset(_) => 20,
			StudyError::Compilation { .. } => 21,
			StudyError::Execution { .. } => 22,
			StudyError::DownloadWrite { .. } => 30,
			StudyError::NotVerified { .. } => 31,
			_ => -1,
		}
	}
}

/// Columnar cache errors
#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Cache file corrupted: {path}: {reason}")]
	Corrupted { path: PathBuf, reason: String },

	#[error("Cache version mismatch: expected {expected}, found {found}")]
	VersionMismatch { expected: u32, found: u32 },

	#[error("Cache I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Cache Polars error: {0}")]
	Polars(#[from] polars::error::PolarsError),

	#[error("Cache JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Errors talking to the remote mining service
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Service I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Unknown job {0}")]
	UnknownJob(u64),

	#[error("Missing credentials: {0}")]
	Credentials(String),

	#[error("Service endpoint: {0}")]
	Endpoint(String),

	#[error("Unexpected response: {0}")]
	Protocol(String),
}

/// Errors raised while converting bracketed query output to CSV
#[derive(Debug, Error)]
pub enum ConvertError {
	#[error("Invalid continuation rule '{spec}': {reason}")]
	InvalidRule { spec: String, reason: String },

	#[error("Invalid pattern for column {column}: {source}")]
	Pattern {
		column: usize,
		#[source]
		source: regex::Error,
	},

	#[error("Conversion I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// Convenience type alias for Results in the study pipeline.
pub type StudyResult<T> = Result<T, StudyError>;

/// Convenience type alias for cache operation results.
pub type CacheResult<T> = Result<T, CacheError>;

/// Convenience type alias for remote service results.
pub type ServiceResult<T> = Result<T, ServiceError>;
