//! Conversion of bracketed query output (`var[i][j] = value`) to CSV

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};

use regex::Regex;
use tracing::{debug, trace};

use crate::config::CsvSpec;
use crate::error::ConvertError;

/// Options controlling how output lines are split into CSV fields.
///
/// Column indices are zero-based and count the leading variable name when a
/// line has one.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
	/// Columns to drop from every row
	pub drop: BTreeSet<usize>,
	/// Columns whose value keeps consuming `][`-separated segments until the
	/// lower-cased text matches the pattern
	pub continuations: BTreeMap<usize, Regex>,
	/// Line printed before any converted rows
	pub header: Option<String>,
	/// Number of bracketed indices; inferred from the first line when unset
	pub numidx: Option<usize>,
}

impl ConvertOptions {
	/// Options described by a target's `csv` block.
	pub fn from_csv_spec(spec: &CsvSpec) -> Result<Self, ConvertError> {
		let mut options = Self {
			drop: spec.drop.iter().copied().collect(),
			header: spec.header.clone(),
			numidx: spec.numidx,
			..Self::default()
		};
		for rule in &spec.test {
			options = options.with_rule(rule)?;
		}
		Ok(options)
	}

	pub fn drop_column(mut self, column: usize) -> Self {
		self.drop.insert(column);
		self
	}

	/// Add a continuation rule given as `column,regex`.
	pub fn with_rule(mut self, spec: &str) -> Result<Self, ConvertError> {
		let (column, pattern) = parse_rule(spec)?;
		self.continuations.insert(column, pattern);
		Ok(self)
	}

	pub fn with_header(mut self, header: impl Into<String>) -> Self {
		self.header = Some(header.into());
		self
	}

	pub fn with_numidx(mut self, numidx: usize) -> Self {
		self.numidx = Some(numidx);
		self
	}
}

/// Parse a `column,regex` continuation rule.
pub fn parse_rule(spec: &str) -> Result<(usize, Regex), ConvertError> {
	let (column, pattern) = spec.split_once(',').ok_or_else(|| ConvertError::InvalidRule {
		spec: spec.to_string(),
		reason: "expected <column>,<regex>".to_string(),
	})?;
	let column = column
		.trim()
		.parse::<usize>()
		.map_err(|e| ConvertError::InvalidRule {
			spec: spec.to_string(),
			reason: e.to_string(),
		})?;
	let pattern = Regex::new(pattern).map_err(|source| ConvertError::Pattern { column, source })?;
	Ok((column, pattern))
}

/// Stateful converter; remembers the inferred index count across lines.
#[derive(Debug)]
pub struct Converter {
	options: ConvertOptions,
	numidx: Option<usize>,
}

impl Converter {
	pub fn new(options: ConvertOptions) -> Self {
		let numidx = options.numidx;
		Self { options, numidx }
	}

	/// Index count in effect (configured or inferred).
	pub fn numidx(&self) -> Option<usize> {
		self.numidx
	}

	/// Convert every line of `input`, returning the number of rows written.
	pub fn convert<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<usize, ConvertError> {
		if let Some(header) = &self.options.header {
			writeln!(output, "{header}")?;
		}
		let mut rows = 0usize;
		for line in input.lines() {
			let line = line?;
			if let Some(row) = self.convert_line(&line) {
				writeln!(output, "{row}")?;
				rows += 1;
			}
		}
		debug!("Convert: wrote {} rows", rows);
		Ok(rows)
	}

	/// Convert a single line; blank lines yield `None`.
	pub fn convert_line(&mut self, line: &str) -> Option<String> {
		let line = line.trim_end_matches(['\n', '\r']);
		if line.trim().is_empty() {
			return None;
		}
		let row = self
			.split(&escape(line))
			.into_iter()
			.enumerate()
			.filter(|(i, _)| !self.options.drop.contains(i))
			.map(|(_, field)| format!("\"{field}\""))
			.collect::<Vec<_>>()
			.join(",");
		trace!("Convert: {line} -> {row}");
		Some(row)
	}

	fn split(&mut self, s: &str) -> Vec<String> {
		let mut parts: Vec<String> = Vec::new();
		let mut cur = 0;

		if let Some(open) = s.find('[') {
			if open > 0 {
				parts.push(s[..open].to_string());
			}
			cur = open + 1;

			let mut indices = 0usize;
			let mut next = find_from(s, "][", cur);
			while let Some(mut end) = next {
				if self.numidx.is_some_and(|n| indices + 1 >= n) {
					break;
				}
				if let Some(rule) = self.options.continuations.get(&parts.len()) {
					let mut candidate = Some(end);
					while let Some(e) = candidate {
						if rule.is_match(&s[cur..e].to_lowercase()) {
							break;
						}
						candidate = find_from(s, "][", e + 2);
					}
					match candidate {
						Some(e) => end = e,
						None => break,
					}
				}
				parts.push(s[cur..end].to_string());
				indices += 1;
				cur = end + 2;
				next = find_from(s, "][", cur);
			}

			if self.numidx.is_none() {
				self.numidx = Some(indices + 1);
				debug!("Convert: inferred {} indices", indices + 1);
			}
		}

		if let Some(close) = find_from(s, "] = ", cur) {
			parts.push(s[cur..close].to_string());
			cur = close + 1;
		}
		if let Some(eq) = find_from(s, " = ", cur) {
			parts.push(s[eq + 3..].to_string());
		}
		parts
	}
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
	haystack.get(from..)?.find(needle).map(|i| i + from)
}

/// Double embedded quotes and protect literal `\n` sequences.
fn escape(line: &str) -> String {
	line.replace("\\n", "\\\\n").replace('"', "\"\"")
}
