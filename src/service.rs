//! Remote mining service: trait seam, scoped session and HTTP adapter
//!
//! The pipeline only talks to [`QueryService`]. [`HttpService`] is one
//! adapter for it: a JSON gateway with the request shapes documented on the
//! type. It has no built-in endpoint; the gateway URL must be configured.

use std::fmt;
use std::fs;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Layout;
use crate::error::{ServiceError, ServiceResult};
use crate::jobs::OutputChecksum;

/// Environment variable the CLI reads the gateway URL from.
pub const ENDPOINT_VAR: &str = "MINESTUDY_ENDPOINT";

/// Compiler or execution status of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
	Waiting,
	Running,
	Finished,
	Error,
}

/// Snapshot of a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
	pub id: u64,
	pub compiler_status: Status,
	pub exec_status: Status,
	#[serde(default)]
	pub compiler_errors: Vec<String>,
	#[serde(default)]
	pub url: String,
	#[serde(default)]
	pub output_size: Option<u64>,
	#[serde(default)]
	pub output_checksum: Option<OutputChecksum>,
}

impl JobReport {
	/// No further status change will happen.
	pub fn is_done(&self) -> bool {
		self.compiler_status == Status::Error
			|| matches!(self.exec_status, Status::Finished | Status::Error)
	}
}

/// Operations the pipeline needs from the mining service.
///
/// Calls block; [`QueryService::wait`] polls until the job settles.
pub trait QueryService {
	/// Submit a query against a dataset, returning the job id.
	fn submit(&mut self, query: &str, dataset: &str) -> ServiceResult<u64>;

	fn job(&mut self, job: u64) -> ServiceResult<JobReport>;

	fn set_public(&mut self, job: u64, public: bool) -> ServiceResult<()>;

	/// Stream a job's output into `out`, returning the bytes written.
	fn download(&mut self, job: u64, out: &mut dyn Write) -> ServiceResult<u64>;

	fn close(&mut self) -> ServiceResult<()>;

	fn poll_interval(&self) -> Duration {
		Duration::from_secs(5)
	}

	fn wait(&mut self, job: u64) -> ServiceResult<JobReport> {
		loop {
			let report = self.job(job)?;
			if report.is_done() {
				return Ok(report);
			}
			debug!("Service: job {job} is {:?}", report.exec_status);
			thread::sleep(self.poll_interval());
		}
	}
}

impl<S: QueryService + ?Sized> QueryService for &mut S {
	fn submit(&mut self, query: &str, dataset: &str) -> ServiceResult<u64> {
		(**self).submit(query, dataset)
	}
	fn job(&mut self, job: u64) -> ServiceResult<JobReport> {
		(**self).job(job)
	}
	fn set_public(&mut self, job: u64, public: bool) -> ServiceResult<()> {
		(**self).set_public(job, public)
	}
	fn download(&mut self, job: u64, out: &mut dyn Write) -> ServiceResult<u64> {
		(**self).download(job, out)
	}
	fn close(&mut self) -> ServiceResult<()> {
		(**self).close()
	}
	fn poll_interval(&self) -> Duration {
		(**self).poll_interval()
	}
	fn wait(&mut self, job: u64) -> ServiceResult<JobReport> {
		(**self).wait(job)
	}
}

/// An open service connection, closed when dropped.
pub struct ServiceSession<S: QueryService> {
	service: S,
	closed: bool,
}

impl<S: QueryService> ServiceSession<S> {
	pub fn new(service: S) -> Self {
		Self {
			service,
			closed: false,
		}
	}

	/// Close explicitly, surfacing any error.
	pub fn close(mut self) -> ServiceResult<()> {
		self.closed = true;
		self.service.close()
	}
}

impl<S: QueryService> Deref for ServiceSession<S> {
	type Target = S;

	fn deref(&self) -> &S {
		&self.service
	}
}

impl<S: QueryService> DerefMut for ServiceSession<S> {
	fn deref_mut(&mut self) -> &mut S {
		&mut self.service
	}
}

impl<S: QueryService> Drop for ServiceSession<S> {
	fn drop(&mut self) {
		if !self.closed {
			if let Err(e) = self.service.close() {
				warn!("Service: failed to close session: {}", e);
			}
		}
	}
}

/// Connects on first use; targets that are already current never log in.
pub struct LazyService<S, F>
where
	S: QueryService,
	F: FnMut() -> ServiceResult<S>,
{
	connect: F,
	inner: Option<S>,
}

impl<S, F> LazyService<S, F>
where
	S: QueryService,
	F: FnMut() -> ServiceResult<S>,
{
	pub fn new(connect: F) -> Self {
		Self {
			connect,
			inner: None,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.inner.is_some()
	}

	fn get(&mut self) -> ServiceResult<&mut S> {
		match &mut self.inner {
			Some(service) => Ok(service),
			slot => Ok(slot.insert((self.connect)()?)),
		}
	}
}

impl<S, F> QueryService for LazyService<S, F>
where
	S: QueryService,
	F: FnMut() -> ServiceResult<S>,
{
	fn submit(&mut self, query: &str, dataset: &str) -> ServiceResult<u64> {
		self.get()?.submit(query, dataset)
	}
	fn job(&mut self, job: u64) -> ServiceResult<JobReport> {
		self.get()?.job(job)
	}
	fn set_public(&mut self, job: u64, public: bool) -> ServiceResult<()> {
		self.get()?.set_public(job, public)
	}
	fn download(&mut self, job: u64, out: &mut dyn Write) -> ServiceResult<u64> {
		self.get()?.download(job, out)
	}
	fn close(&mut self) -> ServiceResult<()> {
		match self.inner.as_mut() {
			Some(service) => service.close(),
			None => Ok(()),
		}
	}
	fn wait(&mut self, job: u64) -> ServiceResult<JobReport> {
		self.get()?.wait(job)
	}
}

/// Service login; first line user, second line password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	pub user: String,
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("user", &self.user)
			.field("password", &"<redacted>")
			.finish()
	}
}

impl Credentials {
	pub fn parse(text: &str) -> Option<Self> {
		let mut lines = text.lines().map(str::trim);
		let user = lines.next().filter(|s| !s.is_empty())?;
		let password = lines.next().filter(|s| !s.is_empty())?;
		Some(Self {
			user: user.to_string(),
			password: password.to_string(),
		})
	}

	/// Credentials from the study directory, else the user config directory.
	pub fn load(layout: &Layout) -> ServiceResult<Self> {
		let candidates: Vec<PathBuf> = std::iter::once(layout.credentials_file())
			.chain(dirs::config_dir().map(|d| d.join("minestudy").join("boa-credentials.txt")))
			.collect();
		for path in &candidates {
			if let Ok(text) = fs::read_to_string(path) {
				if let Some(credentials) = Self::parse(&text) {
					debug!("Service: using credentials from {}", path.display());
					return Ok(credentials);
				}
				warn!("Service: {} needs a user and a password line", path.display());
			}
		}
		Err(ServiceError::Credentials(format!(
			"no usable credentials in {}",
			candidates
				.iter()
				.map(|p| p.display().to_string())
				.collect::<Vec<_>>()
				.join(" or ")
		)))
	}
}

#[derive(Serialize)]
struct LoginRequest<'a> {
	user: &'a str,
	password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
	token: String,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
	query: &'a str,
	dataset: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
	id: u64,
}

#[derive(Serialize)]
struct PublicRequest {
	public: bool,
}

/// JSON-over-HTTP gateway adapter.
///
/// Paths are relative to the configured endpoint. Every call after login
/// sends `Authorization: Bearer <token>`; a 404 on a job path is
/// [`ServiceError::UnknownJob`].
///
/// | Operation | Request | Response body |
/// |---|---|---|
/// | login | `POST /login` `{"user", "password"}` | `{"token"}` |
/// | submit | `POST /jobs` `{"query", "dataset"}` | `{"id"}` |
/// | job | `GET /jobs/{id}` | [`JobReport`] |
/// | set_public | `PUT /jobs/{id}/public` `{"public"}` | ignored |
/// | download | `GET /jobs/{id}/output` | raw output bytes |
/// | close | `POST /logout` | ignored |
///
/// A [`JobReport`] looks like
/// `{"id": 7, "compiler_status": "FINISHED", "exec_status": "RUNNING",
/// "compiler_errors": [], "url": "...", "output_size": 12,
/// "output_checksum": {"span": 12, "md5": "..."}}`; the last four fields
/// are optional.
#[derive(Debug)]
pub struct HttpService {
	client: Client,
	endpoint: String,
	token: Option<String>,
}

impl HttpService {
	/// Log in and return a ready client.
	pub fn connect(endpoint: &str, credentials: &Credentials) -> ServiceResult<Self> {
		if endpoint.trim().is_empty() {
			return Err(ServiceError::Endpoint(format!(
				"no service endpoint configured; pass --endpoint or set {ENDPOINT_VAR}"
			)));
		}
		let client = Client::builder().timeout(None).build()?;
		let endpoint = endpoint.trim_end_matches('/').to_string();
		let login: LoginResponse = client
			.post(format!("{endpoint}/login"))
			.json(&LoginRequest {
				user: &credentials.user,
				password: &credentials.password,
			})
			.send()?
			.error_for_status()?
			.json()?;
		info!("Service: logged in to {} as {}", endpoint, credentials.user);
		Ok(Self {
			client,
			endpoint,
			token: Some(login.token),
		})
	}

	fn authorized(&self, request: RequestBuilder) -> ServiceResult<RequestBuilder> {
		let token = self
			.token
			.as_deref()
			.ok_or_else(|| ServiceError::Protocol("session already closed".to_string()))?;
		Ok(request.bearer_auth(token))
	}

	fn job_request(&self, job: u64, suffix: &str) -> String {
		format!("{}/jobs/{job}{suffix}", self.endpoint)
	}

	fn checked(response: Response, job: u64) -> ServiceResult<Response> {
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(ServiceError::UnknownJob(job));
		}
		Ok(response.error_for_status()?)
	}
}

impl QueryService for HttpService {
	fn submit(&mut self, query: &str, dataset: &str) -> ServiceResult<u64> {
		let request = self
			.client
			.post(format!("{}/jobs", self.endpoint))
			.json(&SubmitRequest { query, dataset });
		let submitted: SubmitResponse = self
			.authorized(request)?
			.send()?
			.error_for_status()?
			.json()?;
		debug!("Service: submitted job {}", submitted.id);
		Ok(submitted.id)
	}

	fn job(&mut self, job: u64) -> ServiceResult<JobReport> {
		let request = self.client.get(self.job_request(job, ""));
		let response = Self::checked(self.authorized(request)?.send()?, job)?;
		Ok(response.json()?)
	}

	fn set_public(&mut self, job: u64, public: bool) -> ServiceResult<()> {
		let request = self
			.client
			.put(self.job_request(job, "/public"))
			.json(&PublicRequest { public });
		Self::checked(self.authorized(request)?.send()?, job)?;
		Ok(())
	}

	fn download(&mut self, job: u64, out: &mut dyn Write) -> ServiceResult<u64> {
		let request = self.client.get(self.job_request(job, "/output"));
		let mut response = Self::checked(self.authorized(request)?.send()?, job)?;
		let written = response.copy_to(out)?;
		out.flush()?;
		Ok(written)
	}

	fn close(&mut self) -> ServiceResult<()> {
		if self.token.is_none() {
			return Ok(());
		}
		let request = self.client.post(format!("{}/logout", self.endpoint));
		let result = self.authorized(request)?.send();
		self.token = None;
		result?.error_for_status()?;
		debug!("Service: logged out");
		Ok(())
	}
}

#[cfg(test)]
pub(crate) mod testing {
	//! In-memory service for driver tests.

	use super::*;
	use std::collections::BTreeMap;

	#[derive(Debug, Clone)]
	pub struct FakeJob {
		pub query: String,
		pub dataset: String,
		pub report: JobReport,
		pub output: Vec<u8>,
		pub public: Option<bool>,
	}

	#[derive(Debug, Default)]
	pub struct FakeService {
		pub jobs: BTreeMap<u64, FakeJob>,
		pub next_output: Vec<u8>,
		pub compiler_status: Option<Status>,
		pub exec_status: Option<Status>,
		/// Corrupt the next `n` downloads by flipping their first byte
		pub corrupt_downloads: usize,
		pub submissions: usize,
		pub downloads: usize,
		pub closed: bool,
	}

	impl FakeService {
		pub fn with_output(output: &str) -> Self {
			Self {
				next_output: output.as_bytes().to_vec(),
				..Self::default()
			}
		}
	}

	pub fn md5_hex(bytes: &[u8]) -> String {
		use md5::{Digest, Md5};
		hex::encode(Md5::digest(bytes))
	}

	impl QueryService for FakeService {
		fn submit(&mut self, query: &str, dataset: &str) -> ServiceResult<u64> {
			self.submissions += 1;
			let id = 1000 + self.jobs.len() as u64;
			let output = self.next_output.clone();
			let report = JobReport {
				id,
				compiler_status: self.compiler_status.unwrap_or(Status::Finished),
				exec_status: self.exec_status.unwrap_or(Status::Finished),
				compiler_errors: vec!["line 1: syntax error".to_string()],
				url: format!("https://example.invalid/jobs/{id}"),
				output_size: Some(output.len() as u64),
				output_checksum: Some(OutputChecksum {
					span: output.len() as u64,
					md5: md5_hex(&output),
				}),
			};
			self.jobs.insert(
				id,
				FakeJob {
					query: query.to_string(),
					dataset: dataset.to_string(),
					report,
					output,
					public: None,
				},
			);
			Ok(id)
		}

		fn job(&mut self, job: u64) -> ServiceResult<JobReport> {
			self.jobs
				.get(&job)
				.map(|j| j.report.clone())
				.ok_or(ServiceError::UnknownJob(job))
		}

		fn set_public(&mut self, job: u64, public: bool) -> ServiceResult<()> {
			let entry = self.jobs.get_mut(&job).ok_or(ServiceError::UnknownJob(job))?;
			entry.public = Some(public);
			Ok(())
		}

		fn download(&mut self, job: u64, out: &mut dyn Write) -> ServiceResult<u64> {
			self.downloads += 1;
			let mut output = self
				.jobs
				.get(&job)
				.ok_or(ServiceError::UnknownJob(job))?
				.output
				.clone();
			if self.corrupt_downloads > 0 {
				self.corrupt_downloads -= 1;
				if let Some(first) = output.first_mut() {
					*first ^= 0xff;
				}
			}
			out.write_all(&output)?;
			Ok(output.len() as u64)
		}

		fn close(&mut self) -> ServiceResult<()> {
			self.closed = true;
			Ok(())
		}
	}
}
