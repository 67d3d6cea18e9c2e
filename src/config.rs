//! Study configuration, on-disk layout and query macro substitution

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::convert::ConvertOptions;
use crate::error::{StudyError, StudyResult};

/// Upper bound on substitution passes; more means the rules feed each other.
const MAX_EXPANSION_PASSES: usize = 64;

/// Directory layout of a study checkout.
///
/// All paths are relative to `root`. Scripts run from the `analyses/`
/// directory resolve to its parent, so the same layout works from both places.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
	pub root: PathBuf,
}

impl Layout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	/// Layout rooted at `dir`, or its parent when `dir` is `analyses/`.
	pub fn discover(dir: impl AsRef<Path>) -> Self {
		let dir = dir.as_ref();
		match (dir.file_name(), dir.parent()) {
			(Some(name), Some(parent)) if name == "analyses" => Self::new(parent),
			_ => Self::new(dir),
		}
	}

	pub fn study_file(&self) -> PathBuf {
		self.root.join("study-config.json")
	}
	pub fn jobs_file(&self) -> PathBuf {
		self.root.join("jobs.json")
	}
	pub fn credentials_file(&self) -> PathBuf {
		self.root.join("boa-credentials.txt")
	}
	pub fn query_root(&self) -> PathBuf {
		self.root.join("boa")
	}
	pub fn snippet_root(&self) -> PathBuf {
		self.query_root().join("snippets")
	}
	pub fn data_root(&self) -> PathBuf {
		self.root.join("data")
	}
	pub fn txt_root(&self) -> PathBuf {
		self.data_root().join("txt")
	}
	pub fn csv_root(&self) -> PathBuf {
		self.data_root().join("csv")
	}
	pub fn parquet_root(&self) -> PathBuf {
		self.data_root().join("parquet")
	}
	pub fn tables_root(&self) -> PathBuf {
		self.root.join("tables")
	}

	/// Local output file of a target.
	pub fn target_output(&self, target: &str) -> PathBuf {
		self.txt_root().join(target)
	}

	/// Target name for a path under `data/txt/`, as passed by build tools.
	pub fn target_name(&self, output: &Path) -> String {
		let relative = output
			.strip_prefix(self.txt_root())
			.or_else(|_| output.strip_prefix("data/txt"))
			.unwrap_or(output);
		relative
			.components()
			.map(|c| c.as_os_str().to_string_lossy())
			.collect::<Vec<_>>()
			.join("/")
	}
}

/// One macro substitution rule.
///
/// `target` is a regular expression; the replacement is either inline text or
/// the contents of a snippet file under `boa/snippets/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Substitution {
	Inline { target: String, replacement: String },
	Snippet { target: String, file: String },
}

impl Substitution {
	pub fn target(&self) -> &str {
		match self {
			Substitution::Inline { target, .. } | Substitution::Snippet { target, .. } => target,
		}
	}
}

/// CSV post-processing of a target's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvSpec {
	pub output: String,
	#[serde(default)]
	pub test: Vec<String>,
	#[serde(default)]
	pub drop: Vec<usize>,
	#[serde(default)]
	pub header: Option<String>,
	#[serde(default)]
	pub numidx: Option<usize>,
}

/// Duplicate-run extraction of a target's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupesSpec {
	pub output: String,
	#[serde(default)]
	pub csv: Option<String>,
}

/// A named remote query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
	/// Query template, relative to `boa/`
	pub query: String,
	/// Dataset alias, resolved through [`StudyConfig::datasets`]
	pub dataset: String,
	#[serde(default)]
	pub substitutions: Vec<Substitution>,
	#[serde(default = "default_make_public")]
	pub make_public: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub csv: Option<CsvSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gendupes: Option<DupesSpec>,
}

fn default_make_public() -> bool {
	true
}

/// An analysis script and the CSV tables it reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
	#[serde(default)]
	pub input: Vec<String>,
}

/// Parsed `study-config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyConfig {
	/// Alias -> dataset name on the service
	#[serde(default)]
	pub datasets: BTreeMap<String, String>,
	#[serde(default)]
	pub queries: BTreeMap<String, QueryConfig>,
	/// Rules applied to every query after target-local ones
	#[serde(default)]
	pub substitutions: Vec<Substitution>,
	#[serde(default)]
	pub analyses: BTreeMap<String, AnalysisConfig>,
}

/// A substitution ready to apply: compiled pattern and resolved text.
#[derive(Debug, Clone)]
pub struct Replacement {
	pub pattern: Regex,
	pub text: String,
}

/// A query after macro expansion, with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
	pub target: String,
	pub dataset: String,
	pub text: String,
	pub sha256: String,
}

impl StudyConfig {
	/// Read and validate a configuration file.
	pub fn load(path: &Path) -> StudyResult<Self> {
		let bytes = fs::read(path).map_err(|e| {
			StudyError::Config(format!(
				"Problem reading job configuration file \"{}\": {e}",
				path.display()
			))
		})?;
		let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
			StudyError::Config(format!(
				"Problem parsing job configuration file \"{}\": {e}",
				path.display()
			))
		})?;
		config.validate()?;
		debug!(
			"Config: loaded {} queries, {} datasets from {}",
			config.queries.len(),
			config.datasets.len(),
			path.display()
		);
		Ok(config)
	}

	/// Check that every substitution target and CSV continuation rule
	/// compiles.
	pub fn validate(&self) -> StudyResult<()> {
		let local = self.queries.values().flat_map(|q| q.substitutions.iter());
		for rule in self.substitutions.iter().chain(local) {
			compile_target(rule.target())?;
		}
		for (target, query) in &self.queries {
			if let Some(csv) = &query.csv {
				ConvertOptions::from_csv_spec(csv).map_err(|e| {
					StudyError::Config(format!("Invalid csv rule for \"{target}\": {e}"))
				})?;
			}
		}
		Ok(())
	}

	/// Converter options for a target's `csv` block.
	pub fn convert_options(&self, target: &str) -> StudyResult<(ConvertOptions, &CsvSpec)> {
		let csv = self.query(target)?.csv.as_ref().ok_or_else(|| {
			StudyError::Config(format!("Target \"{target}\" has no csv block"))
		})?;
		let options = ConvertOptions::from_csv_spec(csv)
			.map_err(|e| StudyError::Config(format!("Invalid csv rule for \"{target}\": {e}")))?;
		Ok((options, csv))
	}

	pub fn query(&self, target: &str) -> StudyResult<&QueryConfig> {
		self.queries
			.get(target)
			.ok_or_else(|| StudyError::UnknownTarget(target.to_string()))
	}

	/// Service dataset name for a target.
	pub fn dataset(&self, target: &str) -> StudyResult<&str> {
		let alias = &self.query(target)?.dataset;
		self.datasets
			.get(alias)
			.map(String::as_str)
			.ok_or_else(|| StudyError::UnknownDataset(alias.clone()))
	}

	/// Resolve substitution rules for a target; local rules shadow global ones.
	pub fn replacements(&self, target: &str, layout: &Layout) -> StudyResult<Vec<Replacement>> {
		let query = self.query(target)?;
		let mut seen = std::collections::HashSet::new();
		let mut out = Vec::new();
		for rule in query.substitutions.iter().chain(self.substitutions.iter()) {
			if !seen.insert(rule.target()) {
				continue;
			}
			let text = match rule {
				Substitution::Inline { replacement, .. } => replacement.clone(),
				Substitution::Snippet { target, file } => {
					let path = layout.snippet_root().join(file);
					fs::read_to_string(&path).map_err(|_| StudyError::MissingSnippet {
						target: target.clone(),
						file: path.clone(),
					})?
				}
			};
			out.push(Replacement {
				pattern: compile_target(rule.target())?,
				text,
			});
		}
		Ok(out)
	}

	/// Files a target's query depends on: template and snippets.
	pub fn query_inputs(&self, target: &str, layout: &Layout) -> StudyResult<Vec<PathBuf>> {
		let query = self.query(target)?;
		let mut seen = std::collections::HashSet::new();
		let mut inputs = vec![layout.query_root().join(&query.query)];
		for rule in query.substitutions.iter().chain(self.substitutions.iter()) {
			if !seen.insert(rule.target()) {
				continue;
			}
			if let Substitution::Snippet { file, .. } = rule {
				inputs.push(layout.snippet_root().join(file));
			}
		}
		Ok(inputs)
	}

	/// Read the template, expand macros and hash the result.
	pub fn prepare_query(&self, target: &str, layout: &Layout) -> StudyResult<PreparedQuery> {
		let query = self.query(target)?;
		let dataset = self.dataset(target)?.to_string();
		let template_path = layout.query_root().join(&query.query);
		let template = fs::read_to_string(&template_path).map_err(|e| {
			StudyError::Config(format!(
				"Problem reading query \"{}\": {e}",
				template_path.display()
			))
		})?;

		let replacements = self.replacements(target, layout)?;
		let text = expand(&template, &replacements)?;
		let sha256 = content_hash(&dataset, &text);
		trace!("Config: {target} expands to {} bytes, hash {sha256}", text.len());

		Ok(PreparedQuery {
			target: target.to_string(),
			dataset,
			text,
			sha256,
		})
	}

	/// Blake3 digest of a target's configuration block.
	pub fn config_hash(&self, target: &str) -> StudyResult<String> {
		let query = self.query(target)?;
		let json = serde_json::to_vec(query)?;
		Ok(blake3::hash(&json).to_hex().to_string())
	}
}

fn compile_target(target: &str) -> StudyResult<Regex> {
	Regex::new(target)
		.map_err(|e| StudyError::Config(format!("Invalid substitution target '{target}': {e}")))
}

/// Apply replacements until nothing changes.
///
/// Fails when the rules keep rewriting each other, or when a `{@name@}`
/// placeholder survives expansion.
pub fn expand(template: &str, replacements: &[Replacement]) -> StudyResult<String> {
	let mut query = template.to_string();
	let mut passes = 0;
	loop {
		let mut changed = false;
		for replacement in replacements {
			let replaced = replacement
				.pattern
				.replace_all(&query, NoExpand(&replacement.text));
			if replaced != query {
				query = replaced.into_owned();
				changed = true;
			}
		}
		if !changed {
			break;
		}
		passes += 1;
		if passes >= MAX_EXPANSION_PASSES {
			return Err(StudyError::Config(format!(
				"Substitutions did not settle after {MAX_EXPANSION_PASSES} passes"
			)));
		}
	}

	if let Some(unresolved) = find_placeholder(&query) {
		return Err(StudyError::Config(format!(
			"Unresolved placeholder '{unresolved}'"
		)));
	}
	Ok(query)
}

/// First `{@name@}` left in a query.
fn find_placeholder(query: &str) -> Option<&str> {
	let mut from = 0;
	while let Some(start) = query[from..].find("{@").map(|i| i + from) {
		let name_start = start + 2;
		if let Some(len) = query[name_start..].find("@}") {
			let name = &query[name_start..name_start + len];
			if !name.is_empty() && !name.contains(['{', '}', '@']) {
				return Some(&query[start..name_start + len + 2]);
			}
		}
		from = name_start;
	}
	None
}

/// SHA-256 over the dataset name followed by the expanded query text.
pub fn content_hash(dataset: &str, query: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(dataset.as_bytes());
	hasher.update(query.as_bytes());
	hex::encode(hasher.finalize())
}
