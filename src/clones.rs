//! Near-duplicate (clone) detection over token sets

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{StudyError, StudyResult};
use crate::tokens::{TokenMultiset, TokenSet};

/// Score written for the canonical (first-seen) member of a cluster.
pub const CANONICAL: f64 = -1.0;

/// Offset applied to refined multiset scores so they can never be mistaken
/// for a coarse score when compared against the threshold.
const REFINED_OFFSET: f64 = 10.0;

/// Which measure made a pair qualify.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Similarity {
	/// Token-set Jaccard above the threshold
	Coarse(f64),
	/// Coarse check failed; token-multiset Jaccard above the threshold
	Refined(f64),
	/// Read back from `project,similarity,"file"` lines, which do not carry
	/// the measure
	Recorded(f64),
}

impl Similarity {
	pub fn score(&self) -> f64 {
		match *self {
			Similarity::Coarse(s) | Similarity::Refined(s) | Similarity::Recorded(s) => s,
		}
	}

	pub fn measure(&self) -> &'static str {
		match self {
			Similarity::Coarse(_) => "coarse",
			Similarity::Refined(_) => "refined",
			Similarity::Recorded(_) => "recorded",
		}
	}
}

/// One row of clone-detector output.
#[derive(Debug, Clone, PartialEq)]
pub struct ClonePair {
	pub project: i64,
	pub file: String,
	/// `None` marks the canonical member
	pub similarity: Option<Similarity>,
}

impl ClonePair {
	pub fn score(&self) -> f64 {
		self.similarity.map_or(CANONICAL, |s| s.score())
	}

	pub fn is_canonical(&self) -> bool {
		self.similarity.is_none()
	}
}

impl fmt::Display for ClonePair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{},{},\"{}\"",
			self.project,
			self.score(),
			self.file.replace('"', "\"\"")
		)
	}
}

/// A file prepared for comparison.
#[derive(Debug, Clone)]
pub struct TokenizedFile {
	pub project: i64,
	pub file: String,
	pub set: TokenSet,
	pub multiset: TokenMultiset,
}

impl TokenizedFile {
	pub fn new(project: i64, file: impl Into<String>, tokens: &str) -> Self {
		let multiset = TokenMultiset::parse(tokens);
		Self {
			project,
			file: file.into(),
			set: multiset.to_set(),
			multiset,
		}
	}

	fn key(&self) -> (i64, String) {
		(self.project, self.file.clone())
	}
}

/// Tokenize a `(project, file, tokens)` table.
pub fn tokenize(df: &DataFrame, tokens_column: &str) -> StudyResult<Vec<TokenizedFile>> {
	let projects = df.column("project")?.cast(&DataType::Int64)?;
	let files = df.column("file")?.cast(&DataType::String)?;
	let tokens = df.column(tokens_column)?.cast(&DataType::String)?;

	projects
		.i64()?
		.into_iter()
		.zip(files.str()?.into_iter())
		.zip(tokens.str()?.into_iter())
		.enumerate()
		.map(|(row, ((project, file), tokens))| match (project, file) {
			(Some(project), Some(file)) => {
				Ok(TokenizedFile::new(project, file, tokens.unwrap_or_default()))
			}
			_ => Err(StudyError::Config(format!(
				"row {row} has no project or file"
			))),
		})
		.collect()
}

/// Read a headerless `[var,] project, file, tokens` CSV and tokenize it.
pub fn read_token_csv(path: &Path) -> StudyResult<Vec<TokenizedFile>> {
	let mut df = CsvReadOptions::default()
		.with_has_header(false)
		.try_into_reader_with_file_path(Some(path.to_path_buf()))?
		.finish()?;
	let names: &[&str] = match df.width() {
		3 => &["project", "file", "tokens"],
		4 => &["var", "project", "file", "tokens"],
		n => {
			return Err(StudyError::Config(format!(
				"{} has {n} columns, expected project, file and tokens",
				path.display()
			)))
		}
	};
	df.set_column_names(names)?;
	tokenize(&df, "tokens")
}

/// All-pairs Jaccard clone detector.
///
/// Quadratic in the number of files. The outer loop can be restricted to a
/// row range so several processes can each scan a disjoint shard; merge their
/// outputs with [`merge_shards`].
#[derive(Debug, Clone)]
pub struct CloneDetector {
	pub threshold: f64,
	/// Log progress every this many comparisons
	pub progress_every: u64,
}

impl Default for CloneDetector {
	fn default() -> Self {
		Self {
			threshold: 0.8,
			progress_every: 1_000_000,
		}
	}
}

impl CloneDetector {
	pub fn with_threshold(threshold: f64) -> Self {
		Self {
			threshold,
			..Self::default()
		}
	}

	/// Compare two files; `Some` when they qualify as clones.
	pub fn compare(&self, a: &TokenizedFile, b: &TokenizedFile) -> Option<Similarity> {
		let coarse = a.set.jaccard(&b.set);
		if coarse > self.threshold {
			return Some(Similarity::Coarse(coarse));
		}
		let refined = a.multiset.jaccard(&b.multiset);
		(REFINED_OFFSET + refined > REFINED_OFFSET + self.threshold)
			.then_some(Similarity::Refined(refined))
	}

	/// Scan every pair.
	pub fn detect(&self, files: &[TokenizedFile]) -> Vec<ClonePair> {
		self.detect_shard(files, 0..files.len())
	}

	/// Scan pairs `(i, j)` with `i` in `shard` and `j > i` over all files.
	pub fn detect_shard(&self, files: &[TokenizedFile], shard: Range<usize>) -> Vec<ClonePair> {
		let end = shard.end.min(files.len());
		let start = shard.start.min(end);
		let total: u64 = (start..end).map(|i| (files.len() - i - 1) as u64).sum();
		info!(
			"Clones: scanning rows {}..{} of {} ({} pairs)",
			start,
			end,
			files.len(),
			total
		);

		let mut seen: HashSet<(i64, String)> = HashSet::new();
		let mut out = Vec::new();
		let mut compared = 0u64;

		for i in start..end {
			let first = &files[i];
			for second in &files[i + 1..] {
				compared += 1;
				if self.progress_every > 0 && compared % self.progress_every == 0 {
					debug!("Clones: compared {}/{} pairs", compared, total);
				}

				let Some(similarity) = self.compare(first, second) else {
					continue;
				};
				if seen.insert(first.key()) {
					out.push(ClonePair {
						project: first.project,
						file: first.file.clone(),
						similarity: None,
					});
				}
				if seen.insert(second.key()) {
					out.push(ClonePair {
						project: second.project,
						file: second.file.clone(),
						similarity: Some(similarity),
					});
				}
			}
		}

		info!("Clones: {} files flagged", out.len());
		out
	}
}

/// Merge shard outputs given in shard order.
///
/// Keeps the first row per `(project, file)`. Because each shard sees the
/// same pair order as an unsharded scan, this reproduces the unsharded output
/// and drops the duplicate canonical markers independent shards emit.
pub fn merge_shards<I>(shards: I) -> Vec<ClonePair>
where
	I: IntoIterator<Item = Vec<ClonePair>>,
{
	let mut seen: HashSet<(i64, String)> = HashSet::new();
	shards
		.into_iter()
		.flatten()
		.filter(|pair| seen.insert((pair.project, pair.file.clone())))
		.collect()
}

/// Write pairs as `project,similarity,"file"` lines.
pub fn write_pairs<W: Write>(pairs: &[ClonePair], mut out: W) -> std::io::Result<()> {
	for pair in pairs {
		writeln!(out, "{pair}")?;
	}
	Ok(())
}

/// Parse `project,similarity,"file"` lines written by [`write_pairs`].
pub fn read_pairs(text: &str) -> StudyResult<Vec<ClonePair>> {
	let mut reader = csv::ReaderBuilder::new()
		.has_headers(false)
		.from_reader(text.as_bytes());
	let mut pairs = Vec::new();
	for record in reader.records() {
		let record = record.map_err(|e| StudyError::Config(format!("bad clone row: {e}")))?;
		let field = |i: usize| record.get(i).unwrap_or_default();
		let project = field(0)
			.parse::<i64>()
			.map_err(|e| StudyError::Config(format!("bad project '{}': {e}", field(0))))?;
		let score = field(1)
			.parse::<f64>()
			.map_err(|e| StudyError::Config(format!("bad similarity '{}': {e}", field(1))))?;
		pairs.push(ClonePair {
			project,
			file: field(2).to_string(),
			similarity: (score != CANONICAL).then_some(Similarity::Recorded(score)),
		});
	}
	Ok(pairs)
}

/// Clone pairs as a `(project, similarity, measure, file)` DataFrame.
pub fn pairs_frame(pairs: &[ClonePair]) -> PolarsResult<DataFrame> {
	df! {
		"project" => pairs.iter().map(|p| p.project).collect::<Vec<_>>(),
		"similarity" => pairs.iter().map(ClonePair::score).collect::<Vec<_>>(),
		"measure" => pairs
			.iter()
			.map(|p| p.similarity.map_or("canonical", |s| s.measure()))
			.collect::<Vec<_>>(),
		"file" => pairs.iter().map(|p| p.file.clone()).collect::<Vec<_>>(),
	}
}

/// Drop every non-canonical clone from a `(project, file, ...)` table.
pub fn remove_clones(df: DataFrame, pairs: &[ClonePair]) -> StudyResult<DataFrame> {
	let clones: HashSet<(i64, &str)> = pairs
		.iter()
		.filter(|p| !p.is_canonical())
		.map(|p| (p.project, p.file.as_str()))
		.collect();

	let projects = df.column("project")?.cast(&DataType::Int64)?;
	let files = df.column("file")?.cast(&DataType::String)?;
	let keep: BooleanChunked = projects
		.i64()?
		.into_iter()
		.zip(files.str()?.into_iter())
		.map(|(project, file)| match (project, file) {
			(Some(p), Some(f)) => Some(!clones.contains(&(p, f))),
			_ => Some(true),
		})
		.collect();

	let filtered = df.filter(&keep)?;
	info!(
		"Clones: removed {} of {} rows",
		df.height() - filtered.height(),
		df.height()
	);
	Ok(filtered)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file(project: i64, name: &str, tokens: &str) -> TokenizedFile {
		TokenizedFile::new(project, name, tokens)
	}

	#[test]
	fn test_below_threshold_without_refinement_is_not_reported() {
		let detector = CloneDetector::default();
		let a = file(1, "a", "1:A,1:B,1:C");
		let b = file(1, "b", "1:A,1:B,1:C,1:D");
		assert_eq!(a.set.jaccard(&b.set), 0.75);
		assert_eq!(detector.compare(&a, &b), None);
		assert!(detector.detect(&[a, b]).is_empty());
	}

	#[test]
	fn test_refined_measure_rescues_pair() {
		// Same set {A, B, C, D} vs {A, B, C}, but D is rare next to many As
		let detector = CloneDetector::default();
		let a = file(1, "a", "A,A,A,A,A,A,A,A,A,A,B,C");
		let b = file(2, "b", "A,A,A,A,A,A,A,A,A,A,B,C,D");
		assert_eq!(a.set.jaccard(&b.set), 0.75);
		let similarity = detector.compare(&a, &b).unwrap();
		assert_eq!(similarity, Similarity::Refined(12.0 / 13.0));
	}

	#[test]
	fn test_coarse_pass() {
		let detector = CloneDetector::default();
		let a = file(1, "a", "A,B,C,D,E,F,G,H,I,J");
		let b = file(1, "b", "A,B,C,D,E,F,G,H,I,J,K");
		let similarity = detector.compare(&a, &b).unwrap();
		assert_eq!(similarity.measure(), "coarse");
		assert!((similarity.score() - 10.0 / 11.0).abs() < 1e-12);
	}

	#[test]
	fn test_symmetric() {
		let detector = CloneDetector::with_threshold(0.5);
		let files = [
			file(1, "a", "x,y,z,w"),
			file(1, "b", "x,y,z"),
			file(2, "c", "x,x,y,q"),
			file(3, "d", "1:x,2:y,3:z"),
		];
		for a in &files {
			for b in &files {
				assert_eq!(detector.compare(a, b), detector.compare(b, a));
			}
		}
	}

	#[test]
	fn test_canonical_emitted_before_members() {
		let detector = CloneDetector::default();
		let files = vec![
			file(1, "a", "A,B,C,D,E,F,G,H,I,J"),
			file(1, "b", "A,B,C,D,E,F,G,H,I,J"),
			file(2, "c", "Q,R"),
			file(2, "d", "A,B,C,D,E,F,G,H,I,J,K"),
		];
		let pairs = detector.detect(&files);
		let got: Vec<(i64, &str, f64)> = pairs
			.iter()
			.map(|p| (p.project, p.file.as_str(), p.score()))
			.collect();
		assert_eq!(
			got,
			vec![(1, "a", -1.0), (1, "b", 1.0), (2, "d", 10.0 / 11.0)]
		);
	}

	#[test]
	fn test_merge_shards_matches_unsharded_scan() {
		let detector = CloneDetector::default();
		let files = vec![
			file(1, "a", "A,B,C,D,E,F,G,H,I,J"),
			file(1, "b", "K,L,M,N,O,P,Q,R,S,T"),
			file(2, "c", "A,B,C,D,E,F,G,H,I,J,X"),
			file(2, "d", "K,L,M,N,O,P,Q,R,S,T,Y"),
			file(3, "e", "A,B,C,D,E,F,G,H,I,J,X,Z"),
		];
		let whole = detector.detect(&files);

		let left = detector.detect_shard(&files, 0..2);
		let right = detector.detect_shard(&files, 2..files.len());
		// Row 2 is canonical in the right shard but scored in the left one
		assert!(right.iter().any(|p| p.file == "c" && p.is_canonical()));

		let merged = merge_shards([left, right]);
		assert_eq!(merged, whole);
		assert_eq!(
			merged.iter().filter(|p| p.is_canonical()).count(),
			2
		);
	}

	#[test]
	fn test_shard_range_is_clamped() {
		let detector = CloneDetector::default();
		let files = vec![file(1, "a", "A"), file(1, "b", "A")];
		assert_eq!(detector.detect_shard(&files, 1..10).len(), 0);
		assert_eq!(detector.detect_shard(&files, 5..10).len(), 0);
	}

	#[test]
	fn test_write_and_read_pairs() {
		let pairs = vec![
			ClonePair {
				project: 7,
				file: "src/A.kt".to_string(),
				similarity: None,
			},
			ClonePair {
				project: 8,
				file: "src/\"B\".kt".to_string(),
				similarity: Some(Similarity::Coarse(0.9)),
			},
		];
		let mut out = Vec::new();
		write_pairs(&pairs, &mut out).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert_eq!(text, "7,-1,\"src/A.kt\"\n8,0.9,\"src/\"\"B\"\".kt\"\n");

		let read = read_pairs(&text).unwrap();
		assert_eq!(read.len(), 2);
		assert!(read[0].is_canonical());
		assert_eq!(read[1].file, "src/\"B\".kt");
		assert_eq!(read[1].score(), 0.9);
		assert_eq!(read[1].similarity, Some(Similarity::Recorded(0.9)));

		let frame = pairs_frame(&read).unwrap();
		let measures: Vec<_> = frame
			.column("measure")
			.unwrap()
			.str()
			.unwrap()
			.into_iter()
			.flatten()
			.collect();
		assert_eq!(measures, vec!["canonical", "recorded"]);
	}

	#[test]
	fn test_tokenize_and_remove_clones() {
		let df = df! {
			"project" => [1i64, 1, 2],
			"file" => ["a", "b", "c"],
			"tokens" => ["A,B,C,D,E,F,G,H,I,J", "A,B,C,D,E,F,G,H,I,J", "Z"],
		}
		.unwrap();
		let files = tokenize(&df, "tokens").unwrap();
		let pairs = CloneDetector::default().detect(&files);
		let frame = pairs_frame(&pairs).unwrap();
		assert_eq!(frame.height(), 2);

		let out = remove_clones(df, &pairs).unwrap();
		let kept: Vec<&str> = out.column("file").unwrap().str().unwrap().into_no_null_iter().collect();
		assert_eq!(kept, vec!["a", "c"]);
	}
}
