use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::Regex;

/// Labels of the citrus leaf classifier, in output index order.
pub const CITRUS_LABELS: [&str; 5] = ["black spot", "greening", "healthy", "scab", "thrips"];

/// Fixed mapping from class index to human readable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelTable {
    labels: HashMap<usize, String>,
}

impl ClassLabelTable {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .enumerate()
                .map(|(id, name)| (id, name.into()))
                .collect(),
        }
    }

    pub fn citrus() -> Self {
        Self::new(CITRUS_LABELS)
    }

    pub fn empty() -> Self {
        Self {
            labels: HashMap::new(),
        }
    }

    /// Label for `index`, or a synthesized "unknown class index: N" when the
    /// table has no entry. Never empty.
    pub fn label(&self, index: usize) -> Cow<'_, str> {
        match self.labels.get(&index) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(format!("unknown class index: {index}")),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Reads one label per line; line `n` (zero-based) names class `n`.
/// Blank lines are skipped without consuming an index.
pub fn load_class_mapping(file_path: &Path) -> Result<ClassLabelTable, std::io::Error> {
    let file = File::open(file_path)?;
    let reader = BufReader::new(file);

    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let name = line.trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }

    Ok(ClassLabelTable::new(names))
}

/// Parses the `names` entry Ultralytics writes into exported model
/// metadata, a Python dict literal such as `{0: 'person', 1: 'bicycle'}`.
/// Returns `None` when no entry can be read.
pub fn parse_names_metadata(names: &str) -> Option<ClassLabelTable> {
    let entry = Regex::new(r#"(\d+)\s*:\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#).ok()?;
    let labels: HashMap<usize, String> = entry
        .captures_iter(names)
        .filter_map(|caps| {
            let index = caps.get(1)?.as_str().parse().ok()?;
            let name = caps.get(2).or_else(|| caps.get(3))?.as_str();
            Some((index, name.replace("\\'", "'").replace("\\\"", "\"")))
        })
        .collect();
    if labels.is_empty() { None } else { Some(ClassLabelTable { labels }) }
}
