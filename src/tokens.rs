//! Token multisets, token sets and Jaccard measures

use std::collections::{HashMap, HashSet};

/// Token payload of a file with repeated entries counted.
///
/// The payload is one CSV record (`,`-delimited, double quotes honoured).
/// Empty entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMultiset {
	counts: HashMap<String, usize>,
	total: usize,
}

impl TokenMultiset {
	pub fn parse(payload: &str) -> Self {
		let mut reader = csv::ReaderBuilder::new()
			.has_headers(false)
			.flexible(true)
			.from_reader(payload.as_bytes());

		let mut multiset = Self::default();
		// Only the first record counts; embedded newlines end the payload
		if let Some(Ok(record)) = reader.records().next() {
			for token in record.iter().filter(|t| !t.is_empty()) {
				multiset.insert(token);
			}
		}
		multiset
	}

	fn insert(&mut self, token: &str) {
		*self.counts.entry(token.to_string()).or_insert(0) += 1;
		self.total += 1;
	}

	/// Number of tokens, counting repeats.
	pub fn len(&self) -> usize {
		self.total
	}

	pub fn is_empty(&self) -> bool {
		self.total == 0
	}

	pub fn count(&self, token: &str) -> usize {
		self.counts.get(token).copied().unwrap_or(0)
	}

	/// Collapse to a [`TokenSet`], stripping each token's structural prefix.
	pub fn to_set(&self) -> TokenSet {
		TokenSet(
			self.counts
				.keys()
				.map(|t| strip_prefix(t))
				.filter(|t| !t.is_empty())
				.map(str::to_string)
				.collect(),
		)
	}

	/// Multiset Jaccard: `Σ min(a, b) / Σ max(a, b)` over all distinct tokens.
	pub fn jaccard(&self, other: &Self) -> f64 {
		let (small, large) = if self.counts.len() <= other.counts.len() {
			(self, other)
		} else {
			(other, self)
		};
		let intersection: usize = small
			.counts
			.iter()
			.map(|(token, &n)| n.min(large.count(token)))
			.sum();
		let union = self.total + other.total - intersection;
		if union == 0 {
			0.0
		} else {
			intersection as f64 / union as f64
		}
	}
}

/// Tokens with prefixes stripped and duplicates collapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSet(HashSet<String>);

impl TokenSet {
	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn contains(&self, token: &str) -> bool {
		self.0.contains(token)
	}

	/// `|A ∩ B| / |A ∪ B|`; two empty sets have similarity 0.
	pub fn jaccard(&self, other: &Self) -> f64 {
		let (small, large) = if self.len() <= other.len() {
			(self, other)
		} else {
			(other, self)
		};
		let intersection = small.0.iter().filter(|t| large.0.contains(*t)).count();
		let union = self.len() + other.len() - intersection;
		if union == 0 {
			0.0
		} else {
			intersection as f64 / union as f64
		}
	}
}

impl<S: Into<String>> FromIterator<S> for TokenSet {
	fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
		TokenSet(
			iter.into_iter()
				.map(Into::into)
				.filter(|t: &String| !t.is_empty())
				.collect(),
		)
	}
}

/// Drop everything up to and including the first `:`.
fn strip_prefix(token: &str) -> &str {
	match token.find(':') {
		Some(idx) => &token[idx + 1..],
		None => token,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_counts_repeats() {
		let ms = TokenMultiset::parse("1:a,1:a,2:b,,3:c");
		assert_eq!(ms.len(), 4);
		assert_eq!(ms.count("1:a"), 2);
		assert_eq!(ms.count(""), 0);
	}

	#[test]
	fn test_parse_quoted_entries() {
		let ms = TokenMultiset::parse(r#"1:"x,y",2:z"#);
		// csv quoting only applies to whole fields
		assert_eq!(ms.len(), 3);

		let ms = TokenMultiset::parse(r#""1:x,y",2:z"#);
		assert_eq!(ms.len(), 2);
		assert_eq!(ms.count("1:x,y"), 1);
	}

	#[test]
	fn test_to_set_strips_prefix() {
		let set = TokenMultiset::parse("1:a,2:a,3:b,4:").to_set();
		assert_eq!(set.len(), 2);
		assert!(set.contains("a"));
		assert!(set.contains("b"));
	}

	#[test]
	fn test_set_jaccard() {
		let a: TokenSet = ["A", "B", "C"].into_iter().collect();
		let b: TokenSet = ["A", "B", "C", "D"].into_iter().collect();
		assert_eq!(a.jaccard(&b), 0.75);
		assert_eq!(b.jaccard(&a), 0.75);
		assert_eq!(TokenSet::default().jaccard(&TokenSet::default()), 0.0);
	}

	#[test]
	fn test_multiset_jaccard() {
		let a = TokenMultiset::parse("x,x,x,y");
		let b = TokenMultiset::parse("x,x,y,z");
		// min: x=2 y=1 -> 3, max: x=3 y=1 z=1 -> 5
		assert_eq!(a.jaccard(&b), 0.6);
		assert_eq!(b.jaccard(&a), 0.6);
		assert_eq!(a.jaccard(&a), 1.0);
	}
}
