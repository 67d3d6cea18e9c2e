use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{Level, info, subscriber::set_global_default};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8) {
    // Pipeline steps report at INFO; keep stderr quiet unless asked
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // RUST_LOG directives still narrow individual modules
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries converted CSV and tables, so logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    if set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber was already installed");
    }
}

use minestudy::clones::{self, CloneDetector};
use minestudy::convert::{ConvertOptions, Converter};
use minestudy::driver::{self, Driver};
use minestudy::service::{Credentials, HttpService, LazyService, ServiceSession};
use minestudy::store::{DataStore, LoadOptions};
use minestudy::tables::{self, TableOptions};
use minestudy::{JobCache, Layout, StudyConfig, StudyError};

fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose.saturating_sub(opts.quiet));
    if let Err(e) = run(opts) {
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<StudyError>().map_or(-1, StudyError::exit_code);
        std::process::exit(code);
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let root = match opts.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let layout = Layout::discover(root);

    match opts.command {
        Command::Convert { target, drop, test, header, numidx, input, output } => {
            let (mut options, input, output) = match target {
                Some(target) => {
                    let target = layout.target_name(Path::new(&target));
                    let config = StudyConfig::load(&layout.study_file())?;
                    let (options, csv) = config.convert_options(&target)?;
                    let input = input.unwrap_or_else(|| layout.target_output(&target));
                    let output = output.unwrap_or_else(|| layout.csv_root().join(&csv.output));
                    if let Some(dir) = output.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    (options, input, Some(output))
                }
                None => {
                    let input = input.ok_or_else(|| anyhow!("an input file or --target is required"))?;
                    (ConvertOptions::default(), input, output)
                }
            };
            for column in drop {
                options = options.drop_column(column);
            }
            for rule in &test {
                options = options.with_rule(rule)?;
            }
            if let Some(header) = header {
                options = options.with_header(header);
            }
            if let Some(numidx) = numidx {
                options = options.with_numidx(numidx);
            }
            let reader = BufReader::new(File::open(&input)?);
            let mut converter = Converter::new(options);
            let rows = match output {
                Some(path) => converter.convert(reader, BufWriter::new(File::create(path)?))?,
                None => converter.convert(reader, io::stdout().lock())?,
            };
            info!("Converted {rows} rows from {}", input.display());
        }
        Command::Dupes { input } => {
            let reader = BufReader::new(File::open(&input)?);
            minestudy::dedup::extract_duplicate_runs(reader, io::stdout().lock())?;
        }
        Command::Clones { input, start, end, threshold } => {
            let files = clones::read_token_csv(&input)?;
            let detector = CloneDetector::with_threshold(threshold);
            let pairs = detector.detect_shard(&files, start..end.unwrap_or(files.len()));
            clones::write_pairs(&pairs, io::stdout().lock())?;
        }
        Command::MergeClones { shards } => {
            let mut outputs = Vec::with_capacity(shards.len());
            for shard in &shards {
                outputs.push(clones::read_pairs(&fs::read_to_string(shard)?)?);
            }
            clones::write_pairs(&clones::merge_shards(outputs), io::stdout().lock())?;
        }
        Command::RunQuery { output, queryfile, dataset } => {
            let query = fs::read_to_string(&queryfile)?;
            let credentials = Credentials::load(&layout)?;
            let endpoint = opts.endpoint.unwrap_or_default();
            let mut session = ServiceSession::new(HttpService::connect(&endpoint, &credentials)?);
            driver::run_adhoc(&mut *session, &query, &dataset, &output)?;
            session.close()?;
        }
        Command::Download { target } => {
            let target = layout.target_name(&target);
            let config = StudyConfig::load(&layout.study_file())?;
            let mut jobs = JobCache::load(layout.jobs_file());
            let endpoint = opts.endpoint.unwrap_or_default();
            let service = LazyService::new(|| {
                let credentials = Credentials::load(&layout)?;
                HttpService::connect(&endpoint, &credentials)
            });
            let mut session = ServiceSession::new(service);
            let state = Driver::new(&layout, &config, &mut jobs, &mut *session).build(&target)?;
            info!("{target} is {state}");
            session.close()?;
        }
        Command::CheckConfig => {
            let config = StudyConfig::load(&layout.study_file())?;
            let mut jobs = JobCache::load(layout.jobs_file());
            let mut out = io::stdout().lock();
            for target in driver::check_config(&layout, &config, &mut jobs)? {
                writeln!(out, "config cache changed for: data/txt/{target}")?;
            }
        }
        Command::Fingerprint { values } => {
            let mut out = io::stdout().lock();
            for value in values {
                writeln!(out, "{}", minestudy::fingerprint::fingerprint(&value))?;
            }
        }
        Command::Describe { name, subdir, names, column, deduped, timestamp, output } => {
            let store = DataStore::new(layout.clone());
            let options = match names {
                Some(names) => LoadOptions::named(names.split(',')),
                None => LoadOptions::default(),
            };
            let df = if deduped {
                store.load_deduped(&name, &subdir, &options, timestamp)?
            } else {
                store.load(&name, &subdir, &options)?
            };
            let stats = tables::describe(&df, &[column.as_str()])?;
            let table = TableOptions::default().highlighted();
            match output {
                Some(file) => {
                    tables::save_table(&layout, &stats, &file, Some(subdir.as_str()), &table, "minestudy describe")?;
                }
                None => print!("{}", tables::render(&stats, &table)?),
            }
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(version, about = "Software-mining study pipeline")]
pub struct Opts {
    /// Increase verbosity (-v, -vv). Default WARN.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Decrease verbosity (-q). Each -q reduces level by one step.
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,
    /// Study directory; defaults to the current directory (or its parent from analyses/)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
    /// Mining service gateway URL; only needed when a query must run
    #[arg(long, global = true, env = "MINESTUDY_ENDPOINT")]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Convert bracketed query output to CSV
    Convert {
        /// Take options, input and output from this target's csv block
        #[arg(long)]
        target: Option<String>,
        /// Column (0-indexed) to drop; repeatable
        #[arg(short = 'd', long)]
        drop: Vec<usize>,
        /// "column,regex": the column keeps consuming the row until the regex matches
        #[arg(short = 't', long)]
        test: Vec<String>,
        /// Header row to prepend
        #[arg(long)]
        header: Option<String>,
        /// Number of indices; inferred from the first line when omitted
        #[arg(long)]
        numidx: Option<usize>,
        /// Query output file; defaults to the target's output with --target
        input: Option<PathBuf>,
        /// Write here instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Keep only lines of sorted duplicate output whose key repeats
    Dupes {
        input: PathBuf,
    },
    /// Scan a token CSV for near-duplicate files
    Clones {
        input: PathBuf,
        /// First outer row of this shard
        #[arg(long, default_value_t = 0)]
        start: usize,
        /// End (exclusive) of this shard's outer rows
        #[arg(long)]
        end: Option<usize>,
        #[arg(long, default_value_t = 0.8)]
        threshold: f64,
    },
    /// Merge clone shard outputs, given in shard order
    MergeClones {
        #[arg(required = true)]
        shards: Vec<PathBuf>,
    },
    /// Run a query file once and save its output
    RunQuery {
        #[arg(short = 'o', long, required = true)]
        output: PathBuf,
        queryfile: PathBuf,
        /// Service dataset name
        dataset: String,
    },
    /// Bring a target's output (data/txt/<target>) up to date
    Download {
        target: PathBuf,
    },
    /// Clean targets whose configuration changed
    CheckConfig,
    /// Print the 32-bit fingerprint of each value
    Fingerprint {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Summary statistics of one column as a LaTeX table
    Describe {
        /// Table name, without .csv
        name: String,
        /// Subdirectory under data/csv/
        subdir: String,
        /// Comma-separated column names for a headerless CSV
        #[arg(long)]
        names: Option<String>,
        #[arg(long)]
        column: String,
        /// Remove exact duplicates first
        #[arg(long)]
        deduped: bool,
        /// The duplicate table carries a timestamp column
        #[arg(long)]
        timestamp: bool,
        /// File name under tables/<subdir>/; prints to stdout when omitted
        #[arg(short = 'o', long)]
        output: Option<String>,
    },
}
