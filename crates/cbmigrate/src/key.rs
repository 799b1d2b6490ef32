//! Destination document keys.
//!
//! A key is an ordered list of [`KeyPart`]s. It is shared between the source
//! (which may discover a natural key) and the destination (which renders one
//! key per document). The first writer wins: once a key is installed it can
//! no longer be replaced.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{Error, Result};

/// Name of the only supported custom generator.
pub const UUID_GENERATOR: &str = "UUID";

/// Kind of a key part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPartKind {
    /// Emitted verbatim.
    Literal,
    /// Value of a top-level document field.
    Field,
    /// A freshly generated random UUID.
    Uuid,
}

/// One segment of a document key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    /// How the part is rendered.
    pub kind: KeyPartKind,
    /// Literal text, field name, or generator name depending on `kind`.
    pub value: String,
}

impl KeyPart {
    /// Creates a literal part.
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            kind: KeyPartKind::Literal,
            value: value.into(),
        }
    }

    /// Creates a field reference part.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            kind: KeyPartKind::Field,
            value: name.into(),
        }
    }

    /// Creates a generated UUID part.
    pub fn uuid() -> Self {
        Self {
            kind: KeyPartKind::Uuid,
            value: UUID_GENERATOR.to_string(),
        }
    }
}

/// Write-once document key shared by the source and the destination.
///
/// Cloning yields another handle to the same key.
#[derive(Debug, Clone, Default)]
pub struct DocumentKey {
    parts: Arc<OnceLock<Vec<KeyPart>>>,
}

impl DocumentKey {
    /// Creates an unset key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the key definition.
    ///
    /// Returns `false` when a key was already installed, in which case the
    /// existing definition is kept. An empty part list is ignored.
    pub fn set(&self, parts: Vec<KeyPart>) -> bool {
        if parts.is_empty() {
            return false;
        }
        let installed = self.parts.set(parts).is_ok();
        if !installed {
            debug!("document key already set, keeping {:?}", self.parts());
        }
        installed
    }

    /// Whether a key has been installed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.parts.get().is_some()
    }

    /// The installed parts, empty when unset.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        self.parts.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the field name when the key is exactly one field reference.
    #[must_use]
    pub fn non_compound_primary_key(&self) -> Option<&str> {
        match self.parts() {
            [part] if part.kind == KeyPartKind::Field => Some(part.value.as_str()),
            _ => None,
        }
    }

    /// Renders the key for one document.
    ///
    /// Parts are concatenated without a separator. A field that is absent
    /// from the document contributes nothing.
    #[must_use]
    pub fn render(&self, doc: &Document) -> String {
        let mut id = String::new();
        for part in self.parts() {
            match part.kind {
                KeyPartKind::Literal => id.push_str(&part.value),
                KeyPartKind::Field => {
                    if let Some(value) = doc.get(&part.value) {
                        id.push_str(&value_to_key_string(value));
                    }
                }
                KeyPartKind::Uuid => id.push_str(&uuid::Uuid::new_v4().to_string()),
            }
        }
        id
    }
}

/// Canonical key text for a field value.
pub fn value_to_key_string(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(f) => f.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Boolean(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Separator between the segments of a generator expression.
pub const GENERATOR_SEPARATOR: &str = "::";

/// Parses a key generator expression.
///
/// The expression is split on `::`. A segment written `%name%` references a
/// document field and `#UUID#` generates a random UUID. Any other segment is
/// kept as a literal, and so is each `::` separator. Unknown `#name#`
/// generators are rejected.
///
/// ```
/// use cbmigrate::key::{parse_generator, KeyPart};
///
/// let parts = parse_generator("airline::%id%").unwrap();
/// assert_eq!(parts, vec![KeyPart::literal("airline::"), KeyPart::field("id")]);
/// ```
pub fn parse_generator(expr: &str) -> Result<Vec<KeyPart>> {
    let mut parts = Vec::new();
    let mut literal = String::new();

    for (i, segment) in expr.split(GENERATOR_SEPARATOR).enumerate() {
        if i > 0 {
            literal.push_str(GENERATOR_SEPARATOR);
        }
        let part = match segment_token(segment) {
            Some(('%', name)) => KeyPart::field(name),
            Some((_, name)) if name == UUID_GENERATOR => KeyPart::uuid(),
            Some((_, name)) => {
                return Err(Error::KeyGeneration(format!(
                    "custom generator {} is not supported",
                    name
                )))
            }
            None => {
                literal.push_str(segment);
                continue;
            }
        };
        if !literal.is_empty() {
            parts.push(KeyPart::literal(std::mem::take(&mut literal)));
        }
        parts.push(part);
    }

    if !literal.is_empty() {
        parts.push(KeyPart::literal(literal));
    }
    Ok(parts)
}

/// Returns the marker and name of a segment wrapped in `%` or `#`.
fn segment_token(segment: &str) -> Option<(char, &str)> {
    ['%', '#'].into_iter().find_map(|marker| {
        segment
            .strip_prefix(marker)
            .and_then(|rest| rest.strip_suffix(marker))
            .filter(|name| !name.is_empty())
            .map(|name| (marker, name))
    })
}

/// Hash applied to the rendered key text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256, hex encoded.
    Sha256,
    /// SHA-512, hex encoded.
    Sha512,
}

impl HashAlgorithm {
    /// Hashes `key` and returns the lowercase hex digest.
    #[must_use]
    pub fn digest(self, key: &str) -> String {
        match self {
            HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(key.as_bytes())),
            HashAlgorithm::Sha512 => format!("{:x}", Sha512::digest(key.as_bytes())),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(Error::Config(format!(
                "hash algorithm: {} not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Sha512 => f.write_str("sha512"),
        }
    }
}
