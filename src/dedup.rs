//! Exact-duplicate filtering against fingerprint side tables

use std::io::{BufRead, Write};

use polars::prelude::*;
use tracing::{debug, info};

use crate::error::StudyResult;

/// Marker column added by the join; never present in returned frames.
const DUP_MARKER: &str = "__duplicate";

/// Remove every row whose `(project, file)` belongs to a duplicate group.
///
/// `dupes` is a side table with at least `hash`, `project` and `file` columns
/// (a timestamp column may be present and is ignored). Only fingerprints that
/// occur on two or more side-table rows form a group. The main table is left
/// joined on `(project, file)` and rows that found a match are dropped, so the
/// filter is idempotent.
///
/// `project` is normalised to `Int64` and `file` to `String` on both sides so
/// tables inferred from differently quoted CSV files still join.
pub fn remove_duplicates(df: DataFrame, dupes: DataFrame) -> StudyResult<DataFrame> {
	let before = df.height();

	let groups = dupes
		.lazy()
		.select([
			col("hash"),
			col("project").cast(DataType::Int64),
			col("file").cast(DataType::String),
		])
		.filter(col("hash").is_duplicated())
		.unique(
			Some(vec!["project".to_string(), "file".to_string()]),
			UniqueKeepStrategy::First,
		)
		.select([col("project"), col("file"), lit(true).alias(DUP_MARKER)]);

	let filtered = df
		.lazy()
		.with_columns([
			col("project").cast(DataType::Int64),
			col("file").cast(DataType::String),
		])
		.join(
			groups,
			[col("project"), col("file")],
			[col("project"), col("file")],
			JoinArgs::new(JoinType::Left),
		)
		.filter(col(DUP_MARKER).is_null())
		.select([all().exclude([DUP_MARKER])])
		.collect()?;

	info!(
		"Dedup: removed {} of {} rows",
		before - filtered.height(),
		before
	);
	Ok(filtered)
}

/// Copy only the lines of sorted query output whose group key repeats.
///
/// Lines look like `var[hash][project][...] = value`. The key is the text of
/// the first two indices; every line of a run of two or more equal keys is
/// written, including the first. Returns the number of lines written.
pub fn extract_duplicate_runs<R: BufRead, W: Write>(input: R, mut output: W) -> StudyResult<usize> {
	let mut last_key: Option<String> = None;
	let mut pending: Option<String> = None;
	let mut written = 0usize;

	for line in input.lines() {
		let line = line?;
		let key = group_key(&line).map(str::to_string);

		if key.is_some() && key == last_key {
			if let Some(first) = pending.take() {
				writeln!(output, "{first}")?;
				written += 1;
			}
			writeln!(output, "{line}")?;
			written += 1;
		} else {
			pending = Some(line);
		}
		last_key = key;
	}

	debug!("Dedup: wrote {} duplicate lines", written);
	Ok(written)
}

/// Text between the first `[` and the `]` closing the second index.
fn group_key(line: &str) -> Option<&str> {
	let open = line.find('[')?;
	let first_close = open + line[open..].find("][")?;
	let second_close = first_close + 2 + line[first_close + 2..].find(']')?;
	Some(&line[open + 1..second_close])
}
