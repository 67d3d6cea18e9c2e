//! LaTeX table rendering (booktabs) and summary statistics

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use polars::prelude::*;
use tracing::info;

use crate::config::Layout;
use crate::error::StudyResult;

/// Trimming of one end of a `\cmidrule`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Trim {
	#[default]
	None,
	Default,
	Width(String),
}

/// A partial rule spanning columns `start..=end` (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmidrule {
	pub start: usize,
	pub end: usize,
	pub left: Trim,
	pub right: Trim,
}

impl Cmidrule {
	pub fn new(start: usize, end: usize) -> Self {
		Self {
			start,
			end,
			left: Trim::None,
			right: Trim::None,
		}
	}

	pub fn trimmed(mut self, left: Trim, right: Trim) -> Self {
		self.left = left;
		self.right = right;
		self
	}

	fn latex(&self) -> String {
		let mut trim = String::new();
		for (side, spec) in [('l', &self.left), ('r', &self.right)] {
			match spec {
				Trim::None => {}
				Trim::Default => trim.push(side),
				Trim::Width(w) => {
					let _ = write!(trim, "{side}{{{w}}}");
				}
			}
		}
		if trim.is_empty() {
			format!("\\cmidrule{{{}-{}}}", self.start, self.end)
		} else {
			format!("\\cmidrule({trim}){{{}-{}}}", self.start, self.end)
		}
	}
}

/// A rule placed after a row; the header is row 1, data rows start at 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
	AfterRow(usize),
	AfterRowWithWidth(usize, String),
	AfterRowWithSpans(usize, Vec<Cmidrule>),
}

impl Rule {
	pub fn row(&self) -> usize {
		match self {
			Rule::AfterRow(row) | Rule::AfterRowWithWidth(row, _) | Rule::AfterRowWithSpans(row, _) => *row,
		}
	}

	fn latex(&self) -> String {
		match self {
			Rule::AfterRow(_) => "\\midrule".to_string(),
			Rule::AfterRowWithWidth(_, width) => format!("\\midrule[{width}]"),
			Rule::AfterRowWithSpans(_, spans) => {
				let mut spans = spans.clone();
				spans.sort_by_key(|s| s.start);
				spans.iter().map(Cmidrule::latex).collect::<Vec<_>>().join(" ")
			}
		}
	}
}

/// Rules separating the header from the body.
///
/// With `skip_index` the rule spans only the value columns, leaving the first
/// (index) column open.
pub fn auto_header_rules(df: &DataFrame, skip_index: bool) -> Vec<Rule> {
	if skip_index && df.width() > 1 {
		vec![Rule::AfterRowWithSpans(1, vec![Cmidrule::new(2, df.width())])]
	} else {
		vec![Rule::AfterRow(1)]
	}
}

#[derive(Debug, Clone)]
pub struct TableOptions {
	pub decimals: usize,
	pub thousands: Option<char>,
	/// Bold column labels
	pub bold_header: bool,
	/// Bold first column, treated as the row index
	pub bold_index: bool,
	/// `\tabcolsep` to use inside this table
	pub colsep: Option<String>,
	pub rules: Vec<Rule>,
}

impl Default for TableOptions {
	fn default() -> Self {
		Self {
			decimals: 2,
			thousands: Some(','),
			bold_header: false,
			bold_index: false,
			colsep: None,
			rules: Vec::new(),
		}
	}
}

impl TableOptions {
	pub fn highlighted(mut self) -> Self {
		self.bold_header = true;
		self.bold_index = true;
		self
	}

	pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
		self.rules = rules;
		self
	}
}

/// Render a table as a booktabs `tabular`.
pub fn render(df: &DataFrame, options: &TableOptions) -> StudyResult<String> {
	let mut columns: Vec<Vec<String>> = Vec::with_capacity(df.width());
	let mut align = String::new();
	for series in df.get_columns() {
		let dtype = series.dtype();
		let cells = if dtype.is_float() {
			align.push('r');
			series
				.cast(&DataType::Float64)?
				.f64()?
				.into_iter()
				.map(|v| v.map(|v| format_number(v, options.decimals, options.thousands)))
				.collect::<Vec<_>>()
		} else if dtype.is_integer() {
			align.push('r');
			series
				.cast(&DataType::Int64)?
				.i64()?
				.into_iter()
				.map(|v| v.map(|v| format_number(v as f64, 0, options.thousands)))
				.collect()
		} else {
			align.push('l');
			series
				.cast(&DataType::String)?
				.str()?
				.into_iter()
				.map(|v| v.map(escape_latex))
				.collect()
		};
		columns.push(cells.into_iter().map(Option::unwrap_or_default).collect());
	}

	let header = df
		.get_column_names()
		.iter()
		.map(|name| {
			let name = escape_latex(name);
			if options.bold_header {
				format!("\\textbf{{{name}}}")
			} else {
				name
			}
		})
		.collect::<Vec<_>>();

	let mut lines = vec![
		format!("\\begin{{tabular}}{{{align}}}"),
		"\\toprule".to_string(),
		format!("{} \\\\", header.join(" & ")),
	];
	for row in 0..df.height() {
		let cells = columns
			.iter()
			.enumerate()
			.map(|(i, column)| {
				if i == 0 && options.bold_index && !column[row].is_empty() {
					format!("\\textbf{{{}}}", column[row])
				} else {
					column[row].clone()
				}
			})
			.collect::<Vec<_>>();
		lines.push(format!("{} \\\\", cells.join(" & ")));
	}
	lines.push("\\bottomrule".to_string());
	lines.push("\\end{tabular}".to_string());

	let mut rules = options.rules.clone();
	rules.sort_by_key(Rule::row);
	for (offset, rule) in rules.iter().enumerate() {
		let at = (offset + rule.row() + 2).min(lines.len());
		lines.insert(at, rule.latex());
	}

	let mut out = lines.join("\n");
	out.push('\n');
	Ok(out)
}

/// Write a rendered table under `tables/[subdir/]filename`.
pub fn save_table(
	layout: &Layout,
	df: &DataFrame,
	filename: &str,
	subdir: Option<&str>,
	options: &TableOptions,
	generator: &str,
) -> StudyResult<PathBuf> {
	let dir = match subdir {
		Some(subdir) => layout.tables_root().join(subdir),
		None => layout.tables_root(),
	};
	fs::create_dir_all(&dir)?;
	let path = dir.join(filename);

	let mut out = String::from("% DO NOT EDIT\n");
	let _ = writeln!(out, "% this file was automatically generated by {generator}");
	let prefix = colsep_prefix(filename);
	if let Some(colsep) = &options.colsep {
		let _ = writeln!(out, "\\newcommand{{\\oldtabcolsep{prefix}}}{{\\tabcolsep}}");
		let _ = writeln!(out, "\\renewcommand{{\\tabcolsep}}{{{colsep}}}");
	}
	out.push_str(&render(df, options)?);
	if options.colsep.is_some() {
		let _ = writeln!(out, "\\renewcommand{{\\tabcolsep}}{{\\oldtabcolsep{prefix}}}");
	}

	fs::write(&path, out)?;
	info!("Tables: wrote {}", path.display());
	Ok(path)
}

/// Macro-safe name derived from a file name: stem without digits, spaces or `_`.
fn colsep_prefix(filename: &str) -> String {
	filename
		.split('.')
		.next()
		.unwrap_or_default()
		.chars()
		.filter(|c| !c.is_ascii_digit() && *c != ' ' && *c != '_')
		.collect()
}

pub fn escape_latex(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		match c {
			'\\' => out.push_str("\\textbackslash "),
			'~' => out.push_str("\\textasciitilde "),
			'^' => out.push_str("\\textasciicircum "),
			'&' | '%' | '$' | '#' | '_' | '{' | '}' => {
				out.push('\\');
				out.push(c);
			}
			_ => out.push(c),
		}
	}
	out
}

/// Fixed decimals with an optional thousands separator.
pub fn format_number(value: f64, decimals: usize, thousands: Option<char>) -> String {
	if !value.is_finite() {
		return value.to_string();
	}
	let text = format!("{value:.decimals$}");
	let Some(sep) = thousands else {
		return text;
	};
	let (sign, digits) = match text.strip_prefix('-') {
		Some(rest) => ("-", rest),
		None => ("", text.as_str()),
	};
	let (int, frac) = match digits.split_once('.') {
		Some((int, frac)) => (int, Some(frac)),
		None => (digits, None),
	};

	let mut grouped = String::with_capacity(int.len() + int.len() / 3);
	for (i, c) in int.chars().enumerate() {
		if i > 0 && (int.len() - i) % 3 == 0 {
			grouped.push(sep);
		}
		grouped.push(c);
	}
	match frac {
		Some(frac) => format!("{sign}{grouped}.{frac}"),
		None => format!("{sign}{grouped}"),
	}
}

const STATISTICS: [&str; 8] = ["count", "mean", "std", "min", "25%", "50%", "75%", "max"];

/// Count, mean, standard deviation, min, quartiles and max of numeric columns.
///
/// The result has a `statistic` column followed by one `f64` column per input.
pub fn describe(df: &DataFrame, columns: &[&str]) -> StudyResult<DataFrame> {
	let mut out = vec![Series::new("statistic", STATISTICS.to_vec())];
	for name in columns {
		let value = || col(name).cast(DataType::Float64);
		let stats = df
			.clone()
			.lazy()
			.select([
				value().count().cast(DataType::Float64).alias("count"),
				value().mean().alias("mean"),
				value().std(1).alias("std"),
				value().min().alias("min"),
				value()
					.quantile(lit(0.25), QuantileInterpolOptions::Linear)
					.alias("25%"),
				value().median().alias("50%"),
				value()
					.quantile(lit(0.75), QuantileInterpolOptions::Linear)
					.alias("75%"),
				value().max().alias("max"),
			])
			.collect()?;
		let values = STATISTICS
			.iter()
			.map(|stat| Ok(stats.column(stat)?.cast(&DataType::Float64)?.f64()?.get(0)))
			.collect::<PolarsResult<Vec<Option<f64>>>>()?;
		out.push(Series::new(name, values));
	}
	Ok(DataFrame::new(out)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn sample() -> DataFrame {
		df! {
			"lang" => ["Kotlin", "C_sharp"],
			"files" => [12345i64, 7],
			"ratio" => [0.5f64, 1234.5678],
		}
		.unwrap()
	}

	#[test]
	fn test_format_number() {
		assert_eq!(format_number(1234567.891, 2, Some(',')), "1,234,567.89");
		assert_eq!(format_number(-1234.0, 0, Some(',')), "-1,234");
		assert_eq!(format_number(999.0, 1, Some(',')), "999.0");
		assert_eq!(format_number(1234.5, 1, None), "1234.5");
	}

	#[test]
	fn test_escape_latex() {
		assert_eq!(escape_latex("a_b & 50%"), "a\\_b \\& 50\\%");
		assert_eq!(escape_latex("~"), "\\textasciitilde ");
	}

	#[test]
	fn test_render_plain() {
		let tex = render(&sample(), &TableOptions::default()).unwrap();
		assert_eq!(
			tex,
			"\\begin{tabular}{lrr}\n\\toprule\nlang & files & ratio \\\\\nKotlin & 12,345 & 0.50 \\\\\nC\\_sharp & 7 & 1,234.57 \\\\\n\\bottomrule\n\\end{tabular}\n"
		);
	}

	#[test]
	fn test_rule_placement() {
		let options = TableOptions::default().with_rules(vec![
			Rule::AfterRowWithWidth(2, "1pt".to_string()),
			Rule::AfterRow(1),
		]);
		let tex = render(&sample(), &options).unwrap();
		let lines: Vec<_> = tex.lines().collect();
		assert_eq!(lines[2], "lang & files & ratio \\\\");
		assert_eq!(lines[3], "\\midrule");
		assert!(lines[4].starts_with("Kotlin"));
		assert_eq!(lines[5], "\\midrule[1pt]");
		assert!(lines[6].starts_with("C\\_sharp"));
	}

	#[test]
	fn test_cmidrules() {
		let rule = Rule::AfterRowWithSpans(
			1,
			vec![
				Cmidrule::new(4, 5).trimmed(Trim::Default, Trim::None),
				Cmidrule::new(2, 3).trimmed(Trim::None, Trim::Width("2pt".to_string())),
			],
		);
		assert_eq!(
			rule.latex(),
			"\\cmidrule(r{2pt}){2-3} \\cmidrule(l){4-5}"
		);
		assert_eq!(Cmidrule::new(1, 2).latex(), "\\cmidrule{1-2}");
	}

	#[test]
	fn test_auto_header_rules() {
		assert_eq!(
			auto_header_rules(&sample(), true),
			vec![Rule::AfterRowWithSpans(1, vec![Cmidrule::new(2, 3)])]
		);
		assert_eq!(auto_header_rules(&sample(), false), vec![Rule::AfterRow(1)]);
	}

	#[test]
	fn test_highlighted() {
		let tex = render(&sample(), &TableOptions::default().highlighted()).unwrap();
		assert!(tex.contains("\\textbf{lang} & \\textbf{files}"));
		assert!(tex.contains("\\textbf{Kotlin} & 12,345"));
	}

	#[test_log::test]
	fn test_save_table_with_colsep() {
		let dir = TempDir::new().unwrap();
		let layout = Layout::new(dir.path());
		let options = TableOptions {
			colsep: Some("3pt".to_string()),
			..TableOptions::default()
		};
		let path = save_table(&layout, &sample(), "rq_1.tex", Some("kotlin"), &options, "rq1").unwrap();
		assert_eq!(path, dir.path().join("tables/kotlin/rq_1.tex"));

		let text = fs::read_to_string(path).unwrap();
		let lines: Vec<_> = text.lines().collect();
		assert_eq!(lines[0], "% DO NOT EDIT");
		assert_eq!(lines[1], "% this file was automatically generated by rq1");
		assert_eq!(lines[2], "\\newcommand{\\oldtabcolseprq}{\\tabcolsep}");
		assert_eq!(lines[3], "\\renewcommand{\\tabcolsep}{3pt}");
		assert_eq!(
			lines.last().copied(),
			Some("\\renewcommand{\\tabcolsep}{\\oldtabcolseprq}")
		);
	}

	#[test]
	fn test_describe() {
		let df = df! { "astcount" => [1i64, 2, 3, 4] }.unwrap();
		let stats = describe(&df, &["astcount"]).unwrap();
		let values: Vec<f64> = stats
			.column("astcount")
			.unwrap()
			.f64()
			.unwrap()
			.into_iter()
			.map(Option::unwrap)
			.collect();
		assert_eq!(values[0], 4.0);
		assert_eq!(values[1], 2.5);
		assert!((values[2] - 1.2909944).abs() < 1e-6);
		assert_eq!(values[3], 1.0);
		assert_eq!(values[4], 1.75);
		assert_eq!(values[5], 2.5);
		assert_eq!(values[6], 3.25);
		assert_eq!(values[7], 4.0);
	}
}
