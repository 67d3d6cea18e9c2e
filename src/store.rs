//! Dataset loading with a Parquet cache (Parquet + JSON sidecar)

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clones::{remove_clones, tokenize, CloneDetector};
use crate::config::Layout;
use crate::dedup::remove_duplicates;
use crate::error::{CacheError, CacheResult, StudyResult};

/// Bumped whenever the on-disk cache layout changes.
pub const CACHE_VERSION: u32 = 2;

const DEDUPED: &str = "-deduped";
const DECLONED: &str = "-noclones";

type Transform = dyn Fn(DataFrame) -> StudyResult<DataFrame> + Send + Sync;

/// Transform applied to a freshly parsed table before it is cached.
///
/// The key identifies the transform in the cache digest; change it whenever
/// the transform's behaviour changes.
#[derive(Clone)]
pub struct Precache {
	key: String,
	transform: Arc<Transform>,
}

impl Precache {
	pub fn new<F>(key: impl Into<String>, transform: F) -> Self
	where
		F: Fn(DataFrame) -> StudyResult<DataFrame> + Send + Sync + 'static,
	{
		Self {
			key: key.into(),
			transform: Arc::new(transform),
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn apply(&self, df: DataFrame) -> StudyResult<DataFrame> {
		(self.transform)(df)
	}
}

impl fmt::Debug for Precache {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Precache").field("key", &self.key).finish_non_exhaustive()
	}
}

/// Sidecar written next to every cached table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
	pub version: u32,
	/// blake3 digest of the source files' sizes and modification times
	/// plus the load parameters
	pub source: String,
	pub rows: usize,
	pub written_at: DateTime<Utc>,
}

/// Result of probing a cached table.
#[derive(Debug)]
pub enum CacheLookup {
	Hit(DataFrame),
	Miss,
	/// The cache is readable but was built from different inputs
	Stale(String),
	Corrupt(CacheError),
}

/// How to parse a CSV table.
#[derive(Debug, Clone)]
pub struct LoadOptions {
	/// Column names to assign after parsing
	pub names: Option<Vec<String>>,
	pub has_header: bool,
	pub precache: Option<Precache>,
}

impl Default for LoadOptions {
	fn default() -> Self {
		Self {
			names: None,
			has_header: true,
			precache: None,
		}
	}
}

impl LoadOptions {
	/// Headerless CSV with the given column names.
	pub fn named<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
		Self {
			names: Some(names.into_iter().map(Into::into).collect()),
			has_header: false,
			precache: None,
		}
	}

	pub fn with_precache<F>(mut self, key: impl Into<String>, transform: F) -> Self
	where
		F: Fn(DataFrame) -> StudyResult<DataFrame> + Send + Sync + 'static,
	{
		self.precache = Some(Precache::new(key, transform));
		self
	}

	fn key(&self) -> String {
		format!(
			"header={};names={};precache={}",
			self.has_header,
			self.names.as_deref().unwrap_or_default().join(","),
			self.precache.as_ref().map_or("", Precache::key)
		)
	}
}

/// Column names of a duplicate side table written by the converter.
pub fn dupes_columns(timestamp: bool) -> Vec<&'static str> {
	let mut names = vec!["var", "hash", "project"];
	if timestamp {
		names.push("ts");
	}
	names.push("file");
	names
}

/// Loads `data/csv/<subdir>/<name>.csv` tables, caching each under
/// `data/parquet/<subdir>/`.
#[derive(Debug, Clone)]
pub struct DataStore {
	layout: Layout,
}

impl DataStore {
	pub fn new(layout: Layout) -> Self {
		Self { layout }
	}

	pub fn csv_path(&self, subdir: &str, name: &str) -> PathBuf {
		self.layout.csv_root().join(subdir).join(format!("{name}.csv"))
	}

	pub fn parquet_path(&self, subdir: &str, name: &str, variant: &str) -> PathBuf {
		self.layout
			.parquet_root()
			.join(subdir)
			.join(format!("{name}{variant}.parquet"))
	}

	fn meta_path(parquet: &Path) -> PathBuf {
		parquet.with_extension("json")
	}

	/// Load a table, from cache when it is current.
	///
	/// The CSV is only parsed when the cache is missing, stale or corrupt. A
	/// cache whose CSV is gone is used as is.
	pub fn load(&self, name: &str, subdir: &str, options: &LoadOptions) -> StudyResult<DataFrame> {
		let csv = self.csv_path(subdir, name);
		let source = source_digest(&[&csv], &options.key())?;
		self.cached(&self.parquet_path(subdir, name, ""), source.as_deref(), || {
			let df = read_csv(&csv, options)?;
			match &options.precache {
				Some(precache) => precache.apply(df),
				None => Ok(df),
			}
		})
	}

	/// Load a table with every exact-duplicate group removed.
	///
	/// Duplicates come from `dupes.csv` in the same subdirectory, with or
	/// without a timestamp column.
	pub fn load_deduped(
		&self,
		name: &str,
		subdir: &str,
		options: &LoadOptions,
		timestamp: bool,
	) -> StudyResult<DataFrame> {
		let csv = self.csv_path(subdir, name);
		let dupes_csv = self.csv_path(subdir, "dupes");
		let source = source_digest(&[&csv, &dupes_csv], &format!("{}{DEDUPED}", options.key()))?;
		self.cached(&self.parquet_path(subdir, name, DEDUPED), source.as_deref(), || {
			let df = self.load(name, subdir, options)?;
			let dupes = self.load("dupes", subdir, &LoadOptions::named(dupes_columns(timestamp)))?;
			remove_duplicates(df, dupes.drop("var")?)
		})
	}

	/// Load a table with near-duplicate files removed.
	///
	/// The canonical member of each clone cluster is kept.
	pub fn load_decloned(
		&self,
		name: &str,
		subdir: &str,
		options: &LoadOptions,
		tokens_column: &str,
		detector: &CloneDetector,
	) -> StudyResult<DataFrame> {
		let csv = self.csv_path(subdir, name);
		let key = format!(
			"{}{DECLONED};tokens={tokens_column};threshold={}",
			options.key(),
			detector.threshold
		);
		let source = source_digest(&[&csv], &key)?;
		self.cached(&self.parquet_path(subdir, name, DECLONED), source.as_deref(), || {
			let df = self.load(name, subdir, options)?;
			let pairs = detector.detect(&tokenize(&df, tokens_column)?);
			remove_clones(df, &pairs)
		})
	}

	/// Probe a cached table against the digest of its inputs.
	///
	/// Without a digest (the sources are gone) any readable cache of the
	/// current version is a hit.
	pub fn lookup(&self, parquet: &Path, source: Option<&str>) -> CacheLookup {
		if !parquet.exists() {
			return CacheLookup::Miss;
		}
		let meta = match read_metadata(&Self::meta_path(parquet)) {
			Ok(meta) => meta,
			Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
				return CacheLookup::Stale("metadata missing".to_string())
			}
			Err(e) => return CacheLookup::Corrupt(e),
		};
		if meta.version != CACHE_VERSION {
			return CacheLookup::Stale(
				CacheError::VersionMismatch {
					expected: CACHE_VERSION,
					found: meta.version,
				}
				.to_string(),
			);
		}
		if source.is_some_and(|source| meta.source != source) {
			return CacheLookup::Stale("inputs changed".to_string());
		}

		let df = File::open(parquet)
			.map_err(CacheError::from)
			.and_then(|f| ParquetReader::new(f).finish().map_err(CacheError::from));
		match df {
			Ok(df) if df.height() == meta.rows => CacheLookup::Hit(df),
			Ok(df) => CacheLookup::Corrupt(CacheError::Corrupted {
				path: parquet.to_path_buf(),
				reason: format!("expected {} rows, found {}", meta.rows, df.height()),
			}),
			Err(e) => CacheLookup::Corrupt(CacheError::Corrupted {
				path: parquet.to_path_buf(),
				reason: e.to_string(),
			}),
		}
	}

	fn cached<F>(&self, parquet: &Path, source: Option<&str>, build: F) -> StudyResult<DataFrame>
	where
		F: FnOnce() -> StudyResult<DataFrame>,
	{
		match self.lookup(parquet, source) {
			CacheLookup::Hit(df) => {
				match source {
					Some(_) => debug!("Store: cache hit {}", parquet.display()),
					None => info!("Store: sources missing, using cache {}", parquet.display()),
				}
				return Ok(df);
			}
			CacheLookup::Miss => debug!("Store: no cache at {}", parquet.display()),
			CacheLookup::Stale(reason) => info!("Store: rebuilding {}: {}", parquet.display(), reason),
			CacheLookup::Corrupt(e) => warn!("Store: discarding corrupt cache: {}", e),
		}

		let mut df = build()?;
		if let Some(source) = source {
			write_cache(parquet, &mut df, source)?;
		}
		Ok(df)
	}
}

fn read_csv(path: &Path, options: &LoadOptions) -> StudyResult<DataFrame> {
	let mut df = CsvReadOptions::default()
		.with_has_header(options.has_header)
		.try_into_reader_with_file_path(Some(path.to_path_buf()))?
		.finish()?;
	if let Some(names) = &options.names {
		df.set_column_names(names.as_slice())?;
	}
	debug!("Store: parsed {} rows from {}", df.height(), path.display());
	Ok(df)
}

fn read_metadata(path: &Path) -> CacheResult<CacheMetadata> {
	let bytes = fs::read(path)?;
	Ok(serde_json::from_slice(&bytes)?)
}

/// blake3 over the size and modification time of every source file plus a
/// parameter key. `None` when any source is missing.
fn source_digest(sources: &[&Path], key: &str) -> StudyResult<Option<String>> {
	let mut hasher = blake3::Hasher::new();
	for source in sources {
		let meta = match fs::metadata(source) {
			Ok(meta) => meta,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let modified = meta
			.modified()?
			.duration_since(UNIX_EPOCH)
			.map_or(0, |d| d.as_nanos());
		hasher.update(&meta.len().to_le_bytes());
		hasher.update(&modified.to_le_bytes());
	}
	hasher.update(key.as_bytes());
	Ok(Some(hasher.finalize().to_hex().to_string()))
}

fn write_cache(parquet: &Path, df: &mut DataFrame, source: &str) -> CacheResult<()> {
	if let Some(dir) = parquet.parent() {
		fs::create_dir_all(dir)?;
	}
	atomic_write_parquet(parquet, df)?;

	// Sidecar last so a crash never pairs new metadata with an old table
	let meta = CacheMetadata {
		version: CACHE_VERSION,
		source: source.to_string(),
		rows: df.height(),
		written_at: Utc::now(),
	};
	atomic_write(&DataStore::meta_path(parquet), &serde_json::to_vec_pretty(&meta)?)?;
	debug!("Store: cached {} rows at {}", df.height(), parquet.display());
	Ok(())
}

fn atomic_write_parquet(path: &Path, df: &mut DataFrame) -> CacheResult<()> {
	let tmp = path.with_extension("parquet.tmp");
	let mut f = File::create(&tmp)?;
	ParquetWriter::new(&mut f)
		.with_compression(ParquetCompression::Zstd(None))
		.finish(df)?;
	f.flush()?;
	f.sync_all()?;
	drop(f);
	rename_over(&tmp, path)
}

/// Write `bytes` to a temp file and rename it over `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> CacheResult<()> {
	let tmp = path.with_extension("tmp");
	fs::write(&tmp, bytes)?;
	rename_over(&tmp, path)
}

fn rename_over(from: &Path, to: &Path) -> CacheResult<()> {
	#[cfg(windows)]
	{
		if to.exists() {
			fs::remove_file(to)?;
		}
	}
	fs::rename(from, to)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	const KOTLIN: &str = "project,file,tokens\n1,a.kt,\"x,y,z\"\n1,b.kt,\"x,y,z\"\n2,a.kt,\"p,q\"\n";

	fn store_with(files: &[(&str, &str)]) -> (TempDir, DataStore) {
		let dir = TempDir::new().unwrap();
		let store = DataStore::new(Layout::new(dir.path()));
		for (name, contents) in files {
			let path = store.csv_path("kotlin", name);
			fs::create_dir_all(path.parent().unwrap()).unwrap();
			fs::write(path, contents).unwrap();
		}
		(dir, store)
	}

	fn source_for(store: &DataStore) -> String {
		source_digest(
			&[&store.csv_path("kotlin", "files")],
			&LoadOptions::default().key(),
		)
		.unwrap()
		.unwrap()
	}

	#[test_log::test]
	fn test_load_writes_cache_and_sidecar() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		let df = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert_eq!(df.shape(), (3, 3));

		let parquet = store.parquet_path("kotlin", "files", "");
		assert!(parquet.exists());
		let meta = read_metadata(&DataStore::meta_path(&parquet)).unwrap();
		assert_eq!(meta.version, CACHE_VERSION);
		assert_eq!(meta.rows, 3);
		assert!(matches!(
			store.lookup(&parquet, Some(source_for(&store).as_str())),
			CacheLookup::Hit(_)
		));
	}

	#[test_log::test]
	fn test_cache_is_used_when_current() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		let first = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		// Replace the table behind the cache's back; the digest still matches
		let parquet = store.parquet_path("kotlin", "files", "");
		let mut marker = df! { "project" => [9i64], "file" => ["z"], "tokens" => [""] }.unwrap();
		atomic_write_parquet(&parquet, &mut marker).unwrap();
		let meta_path = DataStore::meta_path(&parquet);
		let mut meta = read_metadata(&meta_path).unwrap();
		meta.rows = 1;
		atomic_write(&meta_path, &serde_json::to_vec(&meta).unwrap()).unwrap();

		let second = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert_eq!(first.height(), 3);
		assert_eq!(second.height(), 1);
	}

	#[test_log::test]
	fn test_lookup_distinguishes_miss_stale_corrupt() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		let parquet = store.parquet_path("kotlin", "files", "");
		assert!(matches!(store.lookup(&parquet, Some("x")), CacheLookup::Miss));

		store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert!(matches!(
			store.lookup(&parquet, Some("other")),
			CacheLookup::Stale(_)
		));

		fs::write(&parquet, b"not parquet").unwrap();
		assert!(matches!(
			store.lookup(&parquet, Some(source_for(&store).as_str())),
			CacheLookup::Corrupt(CacheError::Corrupted { .. })
		));

		fs::write(DataStore::meta_path(&parquet), b"{").unwrap();
		assert!(matches!(
			store.lookup(&parquet, Some(source_for(&store).as_str())),
			CacheLookup::Corrupt(CacheError::Json(_))
		));
	}

	#[test_log::test]
	fn test_corrupt_cache_is_rebuilt() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		let parquet = store.parquet_path("kotlin", "files", "");
		fs::write(&parquet, b"garbage").unwrap();

		let df = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert_eq!(df.height(), 3);
		assert!(matches!(
			store.lookup(&parquet, Some(source_for(&store).as_str())),
			CacheLookup::Hit(_)
		));
	}

	#[test_log::test]
	fn test_regenerated_csv_invalidates_cache() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		fs::write(
			store.csv_path("kotlin", "files"),
			"project,file,tokens\n1,a.kt,x\n",
		)
		.unwrap();
		let df = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert_eq!(df.height(), 1);
	}

	#[test_log::test]
	fn test_named_columns_and_precache() {
		fn only_first_project(df: DataFrame) -> StudyResult<DataFrame> {
			Ok(df.lazy().filter(col("project").eq(lit(1i64))).collect()?)
		}
		let (_dir, store) = store_with(&[("files", "1,a.kt,3\n1,b.kt,4\n2,c.kt,5\n")]);
		let options = LoadOptions::named(["project", "file", "astcount"])
			.with_precache("first-project", only_first_project);
		let df = store.load("files", "kotlin", &options).unwrap();
		assert_eq!(df.get_column_names(), &["project", "file", "astcount"]);
		assert_eq!(df.height(), 2);
	}

	#[test_log::test]
	fn test_changed_precache_key_rebuilds() {
		let (_dir, store) = store_with(&[("files", "1,a.kt,3\n1,b.kt,4\n2,c.kt,5\n")]);
		let names = ["project", "file", "astcount"];
		let min_count = 4i64;
		let at_least = LoadOptions::named(names).with_precache("astcount>=4", move |df| {
			Ok(df.lazy().filter(col("astcount").gt_eq(lit(min_count))).collect()?)
		});
		assert_eq!(store.load("files", "kotlin", &at_least).unwrap().height(), 2);

		let everything = LoadOptions::named(names).with_precache("all", Ok);
		assert_eq!(store.load("files", "kotlin", &everything).unwrap().height(), 3);
	}

	#[test_log::test]
	fn test_cache_loads_without_its_csv() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		fs::remove_file(store.csv_path("kotlin", "files")).unwrap();

		let df = store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		assert_eq!(df.shape(), (3, 3));
		assert!(matches!(
			store.lookup(&store.parquet_path("kotlin", "files", ""), None),
			CacheLookup::Hit(_)
		));
	}

	#[test_log::test]
	fn test_touched_csv_is_stale() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		store.load("files", "kotlin", &LoadOptions::default()).unwrap();
		let csv = store.csv_path("kotlin", "files");
		let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
		File::options().write(true).open(&csv).unwrap().set_modified(later).unwrap();

		let parquet = store.parquet_path("kotlin", "files", "");
		assert!(matches!(
			store.lookup(&parquet, Some(source_for(&store).as_str())),
			CacheLookup::Stale(_)
		));
	}

	#[test_log::test]
	fn test_load_deduped() {
		let dupes = "\"d\",\"555\",\"1\",\"a.kt\"\n\"d\",\"555\",\"2\",\"a.kt\"\n";
		let (_dir, store) = store_with(&[("files", KOTLIN), ("dupes", dupes)]);
		let df = store
			.load_deduped("files", "kotlin", &LoadOptions::default(), false)
			.unwrap();
		let files: Vec<_> = df
			.column("file")
			.unwrap()
			.str()
			.unwrap()
			.into_iter()
			.flatten()
			.map(str::to_string)
			.collect();
		assert_eq!(files, vec!["b.kt"]);
		assert!(store.parquet_path("kotlin", "files", DEDUPED).exists());
		assert!(store.parquet_path("kotlin", "dupes", "").exists());
	}

	#[test_log::test]
	fn test_load_decloned() {
		let (_dir, store) = store_with(&[("files", KOTLIN)]);
		let df = store
			.load_decloned(
				"files",
				"kotlin",
				&LoadOptions::default(),
				"tokens",
				&CloneDetector::default(),
			)
			.unwrap();
		// b.kt is a clone of a.kt in project 1
		assert_eq!(df.height(), 2);
		assert!(store.parquet_path("kotlin", "files", DECLONED).exists());
	}

	#[test_log::test]
	fn test_missing_csv_is_an_error() {
		let (_dir, store) = store_with(&[]);
		assert!(store.load("files", "kotlin", &LoadOptions::default()).is_err());
	}

	#[test]
	fn test_dupes_columns() {
		assert_eq!(dupes_columns(false), vec!["var", "hash", "project", "file"]);
		assert_eq!(
			dupes_columns(true),
			vec!["var", "hash", "project", "ts", "file"]
		);
	}
}
