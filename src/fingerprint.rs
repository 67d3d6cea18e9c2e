//! Stable 32-bit string fingerprints compatible with Java's `String.hashCode`

use polars::prelude::*;

use crate::error::StudyResult;

/// Fingerprint a string with the polynomial rolling hash `h = 31 * h + c`.
///
/// Arithmetic wraps in signed 32-bit range and `c` walks the UTF-16 code
/// units of the string, so the result equals `String.hashCode()` on the JVM
/// for every input, including characters outside the BMP. The value is used as
/// a join key against duplicate tables produced by the mining service.
///
/// ```rust
/// use minestudy::fingerprint::fingerprint;
///
/// assert_eq!(fingerprint(""), 0);
/// assert_eq!(fingerprint("a"), 97);
/// assert_eq!(fingerprint("hello"), 99162322);
/// ```
pub fn fingerprint(s: &str) -> i32 {
	s.encode_utf16()
		.fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

/// Append a fingerprint column computed from a string column.
pub fn with_fingerprint(mut df: DataFrame, source: &str, target: &str) -> StudyResult<DataFrame> {
	let hashes: Vec<Option<i32>> = df
		.column(source)?
		.cast(&DataType::String)?
		.str()?
		.into_iter()
		.map(|value| value.map(fingerprint))
		.collect();
	df.with_column(Series::new(target, hashes))?;
	Ok(df)
}

/// Build a `(hash, project, file)` duplicate side table from a content column.
///
/// The output has the same shape as the duplicate tables the service emits and
/// can be fed straight into [`crate::dedup::remove_duplicates`].
pub fn duplicate_table(df: &DataFrame, content: &str) -> StudyResult<DataFrame> {
	let hashed = with_fingerprint(
		df.select(["project", "file", content])?,
		content,
		"hash",
	)?;
	Ok(hashed.select(["hash", "project", "file"])?)
}
