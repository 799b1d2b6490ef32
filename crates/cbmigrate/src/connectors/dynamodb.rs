//! DynamoDB source connector.
//!
//! Works from a table export: the JSON printed by
//! `aws dynamodb describe-table` and a JSON-lines file of items in DynamoDB's
//! typed attribute-value format, one `{"Item": {...}}` per line (the layout
//! of a DynamoDB S3 export).
//!
//! DynamoDB has no partial or array indexes, so index statements are built
//! directly from the key schemas without the analyzer.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bson::{Binary, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectors::common::MAX_FILE_SIZE;
use crate::connectors::Source;
use crate::error::{Error, Result};
use crate::index::{
    generated_primary_index_name, primary_index_statement, DestinationIndex, Index, IndexKey,
    Keyspace, DEFER_BUILD, META_ID,
};
use crate::key::{DocumentKey, KeyPart};

/// Separator between the hash and range key of a composite natural key.
pub const COMPOSITE_KEY_SEPARATOR: &str = "::";

/// DynamoDB export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamoDbConfig {
    /// Output of `describe-table`.
    pub table_description: PathBuf,
    /// JSON-lines item export.
    pub items: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTableOutput {
    table: TableDescription,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TableDescription {
    #[serde(default)]
    table_name: String,
    #[serde(default)]
    item_count: Option<u64>,
    key_schema: Vec<KeySchemaElement>,
    #[serde(default)]
    local_secondary_indexes: Vec<SecondaryIndex>,
    #[serde(default)]
    global_secondary_indexes: Vec<SecondaryIndex>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeySchemaElement {
    attribute_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecondaryIndex {
    key_schema: Vec<KeySchemaElement>,
}

/// A key schema reduced to attribute names; the index is named after them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyIndex {
    name: String,
    keys: Vec<String>,
}

impl KeyIndex {
    fn from_schema(schema: &[KeySchemaElement]) -> Self {
        let keys: Vec<String> = schema.iter().map(|k| k.attribute_name.clone()).collect();
        Self {
            name: keys.join("-"),
            keys,
        }
    }
}

/// DynamoDB source.
pub struct DynamoDbSource {
    config: DynamoDbConfig,
    table: Option<TableDescription>,
    key: DocumentKey,
}

impl DynamoDbSource {
    /// Creates a new DynamoDB source. Files are read on `init`.
    pub fn new(config: DynamoDbConfig) -> Self {
        Self {
            config,
            table: None,
            key: DocumentKey::new(),
        }
    }

    fn table(&self) -> Result<&TableDescription> {
        self.table
            .as_ref()
            .ok_or_else(|| Error::SourceConnection("DynamoDB source not initialised".to_string()))
    }

    fn key_indexes(&self) -> Result<Vec<KeyIndex>> {
        let table = self.table()?;
        let mut indexes = vec![KeyIndex::from_schema(&table.key_schema)];
        indexes.extend(
            table
                .local_secondary_indexes
                .iter()
                .chain(&table.global_secondary_indexes)
                .map(|index| KeyIndex::from_schema(&index.key_schema)),
        );
        Ok(indexes)
    }
}

async fn read_table_description(path: &Path) -> Result<TableDescription> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() > MAX_FILE_SIZE {
        return Err(Error::Config(format!(
            "table description {} exceeds {} bytes",
            path.display(),
            MAX_FILE_SIZE
        )));
    }
    let content = tokio::fs::read_to_string(path).await?;
    let output: DescribeTableOutput = serde_json::from_str(&content)?;
    if output.table.key_schema.is_empty() {
        return Err(Error::SourceConnection(
            "DynamoDB table description has no key schema".to_string(),
        ));
    }
    Ok(output.table)
}

/// Natural key for a table key schema: the hash key, then the range key.
fn natural_key(key_schema: &[KeySchemaElement]) -> Vec<KeyPart> {
    let mut parts = Vec::with_capacity(key_schema.len() * 2);
    for (i, element) in key_schema.iter().enumerate() {
        if i > 0 {
            parts.push(KeyPart::literal(COMPOSITE_KEY_SEPARATOR));
        }
        parts.push(KeyPart::field(&element.attribute_name));
    }
    parts
}

/// Converts one line of an item export into a document.
///
/// Accepts `{"Item": {...}}` as well as a bare attribute map.
pub fn item_to_document(line: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(line)?;
    let item = match value {
        Value::Object(mut map) => match map.remove("Item") {
            Some(Value::Object(item)) => item,
            Some(_) => return Err(Error::Extraction("Item is not an object".to_string())),
            None => map,
        },
        _ => return Err(Error::Extraction("item line is not an object".to_string())),
    };
    attribute_map_to_document(&item)
}

fn attribute_map_to_document(map: &Map<String, Value>) -> Result<Document> {
    let mut doc = Document::new();
    for (name, value) in map {
        doc.insert(name.clone(), attribute_to_bson(value)?);
    }
    Ok(doc)
}

/// Converts a typed attribute value such as `{"N": "42"}` into BSON.
pub fn attribute_to_bson(value: &Value) -> Result<Bson> {
    let invalid = || Error::Extraction(format!("invalid attribute value: {}", value));

    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(invalid());
    };

    let bson = match (kind.as_str(), inner) {
        ("S", Value::String(s)) => Bson::String(s.clone()),
        ("N", Value::String(n)) => parse_number(n).ok_or_else(invalid)?,
        ("BOOL", Value::Bool(b)) => Bson::Boolean(*b),
        ("NULL", _) => Bson::Null,
        ("B", Value::String(b)) => decode_binary(b).ok_or_else(invalid)?,
        ("SS", Value::Array(items)) => Bson::Array(
            items
                .iter()
                .map(|s| s.as_str().map(|s| Bson::String(s.to_string())).ok_or_else(invalid))
                .collect::<Result<_>>()?,
        ),
        ("NS", Value::Array(items)) => Bson::Array(
            items
                .iter()
                .map(|n| n.as_str().and_then(parse_number).ok_or_else(invalid))
                .collect::<Result<_>>()?,
        ),
        ("BS", Value::Array(items)) => Bson::Array(
            items
                .iter()
                .map(|b| b.as_str().and_then(decode_binary).ok_or_else(invalid))
                .collect::<Result<_>>()?,
        ),
        ("L", Value::Array(items)) => Bson::Array(
            items
                .iter()
                .map(attribute_to_bson)
                .collect::<Result<_>>()?,
        ),
        ("M", Value::Object(map)) => Bson::Document(attribute_map_to_document(map)?),
        _ => return Err(invalid()),
    };
    Ok(bson)
}

fn parse_number(text: &str) -> Option<Bson> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Bson::Int64(n));
    }
    text.parse::<f64>().ok().map(Bson::Double)
}

fn decode_binary(text: &str) -> Option<Bson> {
    STANDARD.decode(text).ok().map(|bytes| {
        Bson::Binary(Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes,
        })
    })
}

#[async_trait]
impl Source for DynamoDbSource {
    fn source_type(&self) -> &'static str {
        "dynamodb"
    }

    async fn init(&mut self, key: &DocumentKey) -> Result<()> {
        let table = read_table_description(&self.config.table_description).await?;
        if !tokio::fs::try_exists(&self.config.items).await? {
            return Err(Error::SourceConnection(format!(
                "item export {} not found",
                self.config.items.display()
            )));
        }
        if key.set(natural_key(&table.key_schema)) {
            debug!("Using the key schema of {} as the document key", table.table_name);
        }
        self.key = key.clone();
        self.table = Some(table);
        Ok(())
    }

    async fn count_hint(&self) -> Option<u64> {
        self.table.as_ref().and_then(|t| t.item_count)
    }

    async fn stream_data(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<Document>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(&self.config.items).await?;
        let mut lines = BufReader::new(file).lines();
        let mut count = 0u64;

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let doc = item_to_document(&line)?;
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                sent = tx.send(doc) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
            count += 1;
        }
        info!("Read {} items from DynamoDB export", count);
        Ok(())
    }

    fn provides_index_statements(&self) -> bool {
        true
    }

    async fn get_indexes(&self) -> Result<Vec<Index>> {
        Ok(self
            .key_indexes()?
            .into_iter()
            .map(|index| {
                let keys = index.keys.iter().map(|k| IndexKey::new(k, 1)).collect();
                Index::new(index.name, keys)
            })
            .collect())
    }

    fn destination_index_statements(&self, keyspace: &Keyspace) -> Option<Vec<DestinationIndex>> {
        let indexes = match self.key_indexes() {
            Ok(indexes) => indexes,
            Err(e) => {
                warn!("Cannot build DynamoDB index statements: {}", e);
                return Some(Vec::new());
            }
        };
        let primary_key = self.key.non_compound_primary_key();
        let mut has_primary = false;
        let mut statements = Vec::with_capacity(indexes.len() + 1);

        for index in indexes {
            if let [only] = index.keys.as_slice() {
                if primary_key == Some(only.as_str()) {
                    has_primary = true;
                    let statement = primary_index_statement(&index.name, keyspace);
                    statements.push(DestinationIndex::compiled(index.name, statement));
                    continue;
                }
            }
            let fields: Vec<String> = index
                .keys
                .iter()
                .map(|k| {
                    if primary_key == Some(k.as_str()) {
                        META_ID.to_string()
                    } else {
                        format!("`{}`", k)
                    }
                })
                .collect();
            let statement = format!(
                "CREATE INDEX `{}` ON {}({}) USING GSI WITH {}",
                index.name,
                keyspace,
                fields.join(","),
                DEFER_BUILD
            );
            statements.push(DestinationIndex::compiled(index.name, statement));
        }

        if !has_primary {
            let name = generated_primary_index_name();
            let statement = primary_index_statement(&name, keyspace);
            statements.push(DestinationIndex::compiled(name, statement));
        }
        Some(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABLE: &str = r#"{
        "Table": {
            "TableName": "Music",
            "ItemCount": 3,
            "KeySchema": [
                { "AttributeName": "Artist", "KeyType": "HASH" },
                { "AttributeName": "SongTitle", "KeyType": "RANGE" }
            ],
            "LocalSecondaryIndexes": [
                { "IndexName": "ByYear", "KeySchema": [
                    { "AttributeName": "Artist", "KeyType": "HASH" },
                    { "AttributeName": "Year", "KeyType": "RANGE" }
                ] }
            ],
            "GlobalSecondaryIndexes": [
                { "IndexName": "ByGenre", "KeySchema": [
                    { "AttributeName": "Genre", "KeyType": "HASH" }
                ] }
            ]
        }
    }"#;

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    async fn init_source(table: &str, items: &str) -> (DynamoDbSource, DocumentKey, Vec<NamedTempFile>) {
        let table_file = write_file(table);
        let items_file = write_file(items);
        let mut source = DynamoDbSource::new(DynamoDbConfig {
            table_description: table_file.path().to_path_buf(),
            items: items_file.path().to_path_buf(),
        });
        let key = DocumentKey::new();
        source.init(&key).await.unwrap();
        (source, key, vec![table_file, items_file])
    }

    #[test]
    fn test_attribute_to_bson() {
        let item = r#"{"Item": {
            "Artist": {"S": "No One You Know"},
            "Year": {"N": "2019"},
            "Rating": {"N": "4.5"},
            "Live": {"BOOL": false},
            "Label": {"NULL": true},
            "Cover": {"B": "aGk="},
            "Tags": {"SS": ["rock", "indie"]},
            "Charts": {"L": [{"N": "1"}, {"M": {"Country": {"S": "FR"}}}]}
        }}"#;

        let doc = item_to_document(item).unwrap();

        assert_eq!(doc.get_str("Artist").unwrap(), "No One You Know");
        assert_eq!(doc.get_i64("Year").unwrap(), 2019);
        assert_eq!(doc.get_f64("Rating").unwrap(), 4.5);
        assert!(!doc.get_bool("Live").unwrap());
        assert_eq!(doc.get("Label"), Some(&Bson::Null));
        assert_eq!(doc.get_binary_generic("Cover").unwrap(), &b"hi".to_vec());
        assert_eq!(
            doc.get_array("Tags").unwrap(),
            &vec![Bson::from("rock"), Bson::from("indie")]
        );
        let charts = doc.get_array("Charts").unwrap();
        assert_eq!(charts[0], Bson::Int64(1));
        assert_eq!(
            charts[1].as_document().unwrap().get_str("Country").unwrap(),
            "FR"
        );
    }

    #[test]
    fn test_attribute_to_bson_rejects_malformed() {
        assert!(item_to_document(r#"{"Item": {"a": {"N": "abc"}}}"#).is_err());
        assert!(item_to_document(r#"{"Item": {"a": {"X": 1}}}"#).is_err());
        assert!(item_to_document(r#"{"Item": {"a": "plain"}}"#).is_err());
        assert!(item_to_document("[1]").is_err());
    }

    #[tokio::test]
    async fn test_init_installs_composite_key() {
        let (_source, key, _files) = init_source(TABLE, "").await;

        assert_eq!(
            key.parts(),
            &[
                KeyPart::field("Artist"),
                KeyPart::literal("::"),
                KeyPart::field("SongTitle"),
            ]
        );
        assert_eq!(key.non_compound_primary_key(), None);
    }

    #[tokio::test]
    async fn test_init_missing_items_file() {
        let table_file = write_file(TABLE);
        let mut source = DynamoDbSource::new(DynamoDbConfig {
            table_description: table_file.path().to_path_buf(),
            items: PathBuf::from("/nonexistent/items.json"),
        });

        let result = source.init(&DocumentKey::new()).await;

        assert!(matches!(result, Err(Error::SourceConnection(_))));
    }

    #[tokio::test]
    async fn test_stream_data_reads_every_item() {
        // Arrange
        let items = concat!(
            r#"{"Item": {"Artist": {"S": "A"}, "SongTitle": {"S": "One"}}}"#,
            "\n\n",
            r#"{"Item": {"Artist": {"S": "A"}, "SongTitle": {"S": "Two"}}}"#,
            "\n",
            r#"{"Artist": {"S": "B"}, "SongTitle": {"S": "Three"}}"#,
            "\n"
        );
        let (source, key, _files) = init_source(TABLE, items).await;
        let (tx, mut rx) = mpsc::channel(8);

        // Act
        let result = source.stream_data(CancellationToken::new(), tx).await;
        let mut ids = Vec::new();
        while let Some(doc) = rx.recv().await {
            ids.push(key.render(&doc));
        }

        // Assert
        assert!(result.is_ok());
        assert_eq!(ids, vec!["A::One", "A::Two", "B::Three"]);
        assert_eq!(source.count_hint().await, Some(3));
    }

    #[tokio::test]
    async fn test_index_statements() {
        let (source, _key, _files) = init_source(TABLE, "").await;
        let keyspace = Keyspace::new("b", "s", "c");

        let statements = source.destination_index_statements(&keyspace).unwrap();

        let names: Vec<&str> = statements.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names[..3], ["Artist-SongTitle", "Artist-Year", "Genre"]);
        assert_eq!(
            statements[0].statement.as_deref(),
            Ok("CREATE INDEX `Artist-SongTitle` ON `b`.`s`.`c`(`Artist`,`SongTitle`) USING GSI WITH {\"defer_build\":true}")
        );
        assert!(statements[3].name.starts_with("primary-"));
        assert_eq!(source.get_indexes().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_index_statements_quote_dotted_attribute_names() {
        let table = r#"{"Table": {
            "TableName": "Orders",
            "KeySchema": [ { "AttributeName": "order.id", "KeyType": "HASH" } ],
            "GlobalSecondaryIndexes": [ { "IndexName": "ByCustomer", "KeySchema": [
                { "AttributeName": "customer.email", "KeyType": "HASH" },
                { "AttributeName": "placed.at", "KeyType": "RANGE" }
            ] } ]
        }}"#;
        let (source, _key, _files) = init_source(table, "").await;

        let statements = source
            .destination_index_statements(&Keyspace::new("b", "s", "c"))
            .unwrap();

        assert_eq!(
            statements[1].statement.as_deref(),
            Ok("CREATE INDEX `customer.email-placed.at` ON `b`.`s`.`c`(`customer.email`,`placed.at`) USING GSI WITH {\"defer_build\":true}")
        );
    }

    #[test]
    fn test_index_statements_before_init_are_empty() {
        let source = DynamoDbSource::new(DynamoDbConfig {
            table_description: PathBuf::from("table.json"),
            items: PathBuf::from("items.json"),
        });

        let statements = source.destination_index_statements(&Keyspace::new("b", "s", "c"));

        assert_eq!(statements, Some(Vec::new()));
        assert!(source.provides_index_statements());
    }

    #[tokio::test]
    async fn test_index_statements_single_hash_key() {
        let table = r#"{"Table": {
            "TableName": "Users",
            "KeySchema": [ { "AttributeName": "UserId", "KeyType": "HASH" } ],
            "GlobalSecondaryIndexes": [ { "IndexName": "ByEmail", "KeySchema": [
                { "AttributeName": "Email", "KeyType": "HASH" },
                { "AttributeName": "UserId", "KeyType": "RANGE" }
            ] } ]
        }}"#;
        let (source, key, _files) = init_source(table, "").await;
        assert_eq!(key.non_compound_primary_key(), Some("UserId"));

        let statements = source
            .destination_index_statements(&Keyspace::new("b", "s", "c"))
            .unwrap();

        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].statement.as_deref(),
            Ok("CREATE PRIMARY INDEX `UserId` ON `b`.`s`.`c` USING GSI WITH {\"defer_build\":true}")
        );
        assert_eq!(
            statements[1].statement.as_deref(),
            Ok("CREATE INDEX `Email-UserId` ON `b`.`s`.`c`(`Email`,meta().id) USING GSI WITH {\"defer_build\":true}")
        );
    }
}
