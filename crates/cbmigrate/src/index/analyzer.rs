//! Index field-path analyzer.
//!
//! The source schema does not say which dotted paths cross arrays, so the
//! analyzer samples migrated documents and records, per referenced path, how
//! often each array-annotated variant occurs. The most frequent variant wins.

use bson::{Bson, Document};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::compiler::create_index_query;
use super::{
    generated_primary_index_name, primary_index_statement, DestinationIndex, Index,
    IndexFieldPath, Keyspace, ARRAY_MARKER, META_ID,
};
use crate::connectors::Analyzer;
use crate::key::DocumentKey;

/// Default number of resolved samples per path.
pub const DEFAULT_SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct PathSamples {
    total: usize,
    /// Variants in first-seen order, so ties resolve to the earliest.
    variants: Vec<(String, usize)>,
}

impl PathSamples {
    fn record(&mut self, variant: String) {
        self.total += 1;
        match self.variants.iter_mut().find(|(v, _)| *v == variant) {
            Some((_, count)) => *count += 1,
            None => self.variants.push((variant, 1)),
        }
    }

    fn majority(&self) -> Option<&str> {
        let mut best: Option<(&str, usize)> = None;
        for (variant, count) in &self.variants {
            if best.map_or(true, |(_, max)| *count > max) {
                best = Some((variant, *count));
            }
        }
        best.map(|(variant, _)| variant)
    }
}

/// Samples documents to resolve array-annotated index paths.
///
/// One instance serves one migration run and is driven by the single
/// consumer of the document stream.
#[derive(Debug)]
pub struct FieldPathAnalyzer {
    sample_limit: usize,
    indexes: Vec<Index>,
    key: DocumentKey,
    paths: BTreeMap<String, PathSamples>,
}

impl Default for FieldPathAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_LIMIT)
    }
}

impl FieldPathAnalyzer {
    /// Creates an analyzer that stops sampling a path after `sample_limit` hits.
    #[must_use]
    pub fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit,
            indexes: Vec::new(),
            key: DocumentKey::new(),
            paths: BTreeMap::new(),
        }
    }

    /// Number of seeded paths.
    #[must_use]
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Resolved samples recorded for `field`.
    #[must_use]
    pub fn samples(&self, field: &str) -> usize {
        self.paths.get(field).map_or(0, |s| s.total)
    }
}

impl Analyzer for FieldPathAnalyzer {
    fn init(&mut self, indexes: Vec<Index>, key: DocumentKey) {
        for index in &indexes {
            for field in index.referenced_fields() {
                self.paths.entry(field).or_default();
            }
        }
        debug!(
            "Analyzing {} field paths across {} indexes",
            self.paths.len(),
            indexes.len()
        );
        self.indexes = indexes;
        self.key = key;
    }

    fn analyze_data(&mut self, doc: &Document) {
        for (field, samples) in &mut self.paths {
            if samples.total >= self.sample_limit {
                continue;
            }
            if let Some(variant) = navigate_path(field, doc) {
                samples.record(variant);
            }
        }
    }

    fn index_field_path(&self) -> IndexFieldPath {
        let mut field_path: IndexFieldPath = self
            .paths
            .iter()
            .filter_map(|(field, samples)| {
                samples
                    .majority()
                    .map(|variant| (field.clone(), variant.to_string()))
            })
            .collect();
        if let Some(primary) = self.key.non_compound_primary_key() {
            field_path.insert(primary, META_ID);
        }
        field_path
    }

    fn destination_index_statements(&self, keyspace: &Keyspace) -> Vec<DestinationIndex> {
        let field_path = self.index_field_path();
        let primary_key = self.key.non_compound_primary_key();
        let mut has_primary = false;
        let mut statements = Vec::with_capacity(self.indexes.len() + 1);

        for index in &self.indexes {
            if let Some(err) = &index.error {
                statements.push(DestinationIndex::failed(&index.name, err.clone()));
                continue;
            }
            if let [only] = index.keys.as_slice() {
                if primary_key == Some(only.field.as_str()) {
                    has_primary = true;
                    statements.push(DestinationIndex::compiled(
                        &index.name,
                        primary_index_statement(&index.name, keyspace),
                    ));
                    continue;
                }
            }
            if index.unique {
                warn!(
                    "Index {}: uniqueness is not enforced by the destination, creating a regular index",
                    index.name
                );
            }
            statements.push(DestinationIndex {
                name: index.name.clone(),
                statement: create_index_query(keyspace, index, &field_path),
            });
        }

        if !has_primary {
            let name = generated_primary_index_name();
            let statement = primary_index_statement(&name, keyspace);
            statements.push(DestinationIndex::compiled(name, statement));
        }
        statements
    }
}

/// Resolves `path` against `doc`, marking every segment that holds an array.
///
/// Inside an array the first object element containing the next segment is
/// followed. Returns `None` when the path does not resolve.
///
/// ```
/// use bson::doc;
/// use cbmigrate::index::analyzer::navigate_path;
///
/// let doc = doc! { "a": [ { "b": { "c": 1 } } ] };
/// assert_eq!(navigate_path("a.b.c", &doc).as_deref(), Some("a[].b.c"));
/// ```
#[must_use]
pub fn navigate_path(path: &str, doc: &Document) -> Option<String> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut resolved = String::with_capacity(path.len() + 8);
    descend_document(doc, &segments, 0, &mut resolved).then_some(resolved)
}

fn descend_document(doc: &Document, segments: &[&str], index: usize, out: &mut String) -> bool {
    let segment = segments[index];
    let Some(next) = doc.get(segment) else {
        return false;
    };
    if index > 0 {
        out.push('.');
    }
    out.push_str(segment);
    descend(next, segments, index + 1, out)
}

fn descend(value: &Bson, segments: &[&str], index: usize, out: &mut String) -> bool {
    if index >= segments.len() {
        if matches!(value, Bson::Array(_)) {
            out.push_str(ARRAY_MARKER);
        }
        return true;
    }

    match value {
        Bson::Array(items) => {
            let element = items.iter().find_map(|item| match item {
                Bson::Document(d) if d.contains_key(segments[index]) => Some(d),
                _ => None,
            });
            match element {
                Some(d) => {
                    out.push_str(ARRAY_MARKER);
                    descend_document(d, segments, index, out)
                }
                None => false,
            }
        }
        Bson::Document(d) => descend_document(d, segments, index, out),
        _ => false,
    }
}
