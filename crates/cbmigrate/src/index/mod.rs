//! Index model shared by sources, the analyzer and the compiler.
//!
//! Source catalogs are normalised into [`Index`] values. The
//! [`analyzer`] learns which declared field paths traverse arrays and the
//! [`compiler`] turns each index into a destination statement.

pub mod analyzer;
pub mod compiler;
pub mod predicate;

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use analyzer::FieldPathAnalyzer;
pub use compiler::{create_index_query, group_and_combine, ArrayFragment, ArrayKeyGroup};
pub use predicate::{FieldCondition, FieldOperator, LogicalOp, Predicate};

/// Reference to the implicit destination document id.
pub const META_ID: &str = "meta().id";

/// Marker appended to a path segment that traverses an array.
pub const ARRAY_MARKER: &str = "[]";

/// Options attached to every generated statement.
pub const DEFER_BUILD: &str = r#"{"defer_build":true}"#;

/// Per-index failure. Never fatal to a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The source index uses a feature the destination cannot express.
    #[error("{0}")]
    NotSupported(String),

    /// Two array-rooted keys do not share the same array root.
    #[error("multiple array reference: {first} and {second}")]
    MultipleArrayReference {
        /// Root of the first array-rooted key.
        first: String,
        /// Conflicting root.
        second: String,
    },

    /// A `$type` alias without a destination equivalent.
    #[error("type {0} cannot be mapped to a destination type")]
    UnknownType(String),

    /// A predicate operator without a destination equivalent.
    #[error("operator {0} cannot be translated")]
    UnsupportedOperator(String),

    /// A structurally invalid filter document.
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),
}

impl CompileError {
    /// Whether the index was skipped because it is not supported.
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, CompileError::NotSupported(_))
    }
}

/// One key of a compound index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    /// Declared dotted path.
    pub field: String,
    /// `1` ascending, `-1` descending.
    pub order: i32,
}

impl IndexKey {
    /// Creates a key.
    pub fn new(field: impl Into<String>, order: i32) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

/// A source secondary index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    /// Source index name.
    pub name: String,
    /// Ordered keys.
    pub keys: Vec<IndexKey>,
    /// Partial filter, if the index is partial.
    pub partial_expression: Option<Predicate>,
    /// Unique constraint (not enforceable on the destination).
    pub unique: bool,
    /// Documents missing the leading key are not indexed.
    pub sparse: bool,
    /// Set when the index cannot be migrated.
    pub error: Option<CompileError>,
}

impl Index {
    /// Creates an index over `keys`.
    pub fn new(name: impl Into<String>, keys: Vec<IndexKey>) -> Self {
        Self {
            name: name.into(),
            keys,
            ..Default::default()
        }
    }

    /// Creates an index that is reported but never compiled.
    pub fn not_supported(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: Some(CompileError::NotSupported(reason.into())),
            ..Default::default()
        }
    }

    /// Every field referenced by the keys and the partial filter.
    #[must_use]
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.keys.iter().map(|k| k.field.clone()).collect();
        if let Some(predicate) = &self.partial_expression {
            for field in predicate.fields() {
                if !fields.iter().any(|f| f == field) {
                    fields.push(field.to_string());
                }
            }
        }
        fields
    }
}

/// Declared path to array-annotated path.
///
/// `k1.n1k1.n2k1` becomes `k1.n1k1[].n2k1` when `n1k1` holds an array.
/// Unknown paths resolve to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFieldPath(BTreeMap<String, String>);

impl IndexFieldPath {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `field`, falling back to `field` itself.
    #[must_use]
    pub fn get<'a>(&'a self, field: &'a str) -> &'a str {
        match self.0.get(field) {
            Some(path) if !path.is_empty() => path,
            _ => field,
        }
    }

    /// Records the resolved path for `field`.
    pub fn insert(&mut self, field: impl Into<String>, path: impl Into<String>) {
        self.0.insert(field.into(), path.into());
    }

    /// Number of resolved paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no path was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IndexFieldPath {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Fully qualified destination collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    /// Bucket name.
    pub bucket: String,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
}

impl Keyspace {
    /// Creates a keyspace.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`.`{}`", self.bucket, self.scope, self.collection)
    }
}

/// A compiled destination index, or the reason it could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationIndex {
    /// Index name.
    pub name: String,
    /// Statement text or per-index error.
    pub statement: Result<String, CompileError>,
}

impl DestinationIndex {
    /// A compiled statement.
    pub fn compiled(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: Ok(statement.into()),
        }
    }

    /// A failed index.
    pub fn failed(name: impl Into<String>, error: CompileError) -> Self {
        Self {
            name: name.into(),
            statement: Err(error),
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9#_]` with `_`.
pub fn sanitize_index_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '#' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `CREATE PRIMARY INDEX` statement for `name`.
pub fn primary_index_statement(name: &str, keyspace: &Keyspace) -> String {
    format!(
        "CREATE PRIMARY INDEX `{}` ON {} USING GSI WITH {}",
        name,
        keyspace,
        DEFER_BUILD
    )
}

/// Name for the primary index added when the source has none.
#[must_use]
pub fn generated_primary_index_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("primary-{}", &id[..8])
}

/// Statement that builds every deferred index of `keyspace`.
pub fn build_deferred_statement(keyspace: &Keyspace) -> String {
    format!(
        "BUILD INDEX ON {}((SELECT RAW name FROM system:indexes WHERE keyspace_id = '{}' AND scope_id = '{}' AND bucket_id = '{}' AND state = 'deferred'))",
        keyspace, keyspace.collection, keyspace.scope, keyspace.bucket
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_path_identity_fallback() {
        let mut path = IndexFieldPath::new();
        path.insert("a.b", "a[].b");
        path.insert("empty", "");

        assert_eq!(path.get("a.b"), "a[].b");
        assert_eq!(path.get("c"), "c");
        assert_eq!(path.get("empty"), "empty");
    }

    #[test]
    fn test_sanitize_index_name() {
        assert_eq!(sanitize_index_name("k1.n1k1_1_k3_-1"), "k1_n1k1_1_k3__1");
        assert_eq!(sanitize_index_name("idx#2 final"), "idx#2_final");
    }

    #[test]
    fn test_primary_index_statement() {
        let ks = Keyspace::new("b", "s", "c");
        assert_eq!(
            primary_index_statement("_id_", &ks),
            "CREATE PRIMARY INDEX `_id_` ON `b`.`s`.`c` USING GSI WITH {\"defer_build\":true}"
        );
    }

    #[test]
    fn test_generated_primary_index_name() {
        let name = generated_primary_index_name();
        assert!(name.starts_with("primary-"));
        assert_eq!(name.len(), "primary-".len() + 8);
    }

    #[test]
    fn test_build_deferred_statement() {
        let ks = Keyspace::new("travel", "inventory", "airline");
        assert_eq!(
            build_deferred_statement(&ks),
            "BUILD INDEX ON `travel`.`inventory`.`airline`((SELECT RAW name FROM system:indexes WHERE keyspace_id = 'airline' AND scope_id = 'inventory' AND bucket_id = 'travel' AND state = 'deferred'))"
        );
    }

    #[test]
    fn test_referenced_fields_include_predicate() {
        let mut index = Index::new("idx", vec![IndexKey::new("a", 1)]);
        let filter = bson::doc! { "b": { "$gt": 1 }, "$or": [ { "a": 2 }, { "c.d": 3 } ] };
        index.partial_expression = Some(Predicate::parse(&filter).unwrap());

        assert_eq!(index.referenced_fields(), vec!["a", "b", "c.d"]);
    }
}
