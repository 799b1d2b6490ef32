//! Source and destination connectors.
//!
//! The pipeline only talks to the [`Source`], [`Destination`] and
//! [`Analyzer`] traits and never branches on the concrete database.

pub mod common;
pub mod couchbase;
pub mod dynamodb;
pub mod mongodb;

use async_trait::async_trait;
use bson::Document;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SourceConfig;
use crate::error::Result;
use crate::index::{DestinationIndex, Index, IndexFieldPath, Keyspace};
use crate::key::DocumentKey;
use crate::retry::RetryConfig;

/// Outcome of the index migration phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Statements executed successfully.
    pub created: u64,
    /// Indexes skipped as not supported.
    pub skipped: u64,
    /// Indexes that failed to compile or execute.
    pub failed: u64,
}

/// Trait for source database connectors.
#[async_trait]
pub trait Source: Send + Sync {
    /// Get the source type name.
    fn source_type(&self) -> &'static str;

    /// Connect to the source and offer its natural key to `key`.
    async fn init(&mut self, key: &DocumentKey) -> Result<()>;

    /// Number of documents to migrate, when the source can tell cheaply.
    async fn count_hint(&self) -> Option<u64> {
        None
    }

    /// Streams every document into `tx`.
    ///
    /// Implementations must return once `cancel` fires and must drop `tx`
    /// when done, which is how the consumer learns the stream has ended.
    async fn stream_data(&self, cancel: CancellationToken, tx: mpsc::Sender<Document>)
        -> Result<()>;

    /// Secondary indexes read from the source catalog.
    async fn get_indexes(&self) -> Result<Vec<Index>>;

    /// Whether [`Source::destination_index_statements`] replaces the analyzer.
    fn provides_index_statements(&self) -> bool {
        false
    }

    /// Statements for sources without a rich index model.
    ///
    /// `None` means the statements come from the [`Analyzer`].
    fn destination_index_statements(&self, _keyspace: &Keyspace) -> Option<Vec<DestinationIndex>> {
        None
    }
}

/// Trait for destination connectors.
#[async_trait]
pub trait Destination: Send {
    /// Connect, provision the target collection and install any configured key.
    async fn init(&mut self, key: &DocumentKey) -> Result<()>;

    /// Fully qualified target collection.
    fn keyspace(&self) -> Keyspace;

    /// Queues one document, writing a batch when it is full.
    async fn process_data(&mut self, doc: Document) -> Result<()>;

    /// Flushes the trailing partial batch.
    async fn complete(&mut self) -> Result<()>;

    /// Bulk writes issued so far.
    fn batches_written(&self) -> u64 {
        0
    }

    /// Executes index statements in order, then builds deferred indexes.
    async fn create_indexes(&self, indexes: &[DestinationIndex]) -> Result<IndexReport>;
}

/// Learns array paths from sampled documents and compiles index statements.
pub trait Analyzer: Send {
    /// Seeds the analyzer with the source indexes and the shared key.
    fn init(&mut self, indexes: Vec<Index>, key: DocumentKey);

    /// Samples one document.
    fn analyze_data(&mut self, doc: &Document);

    /// Majority-vote path per referenced field.
    fn index_field_path(&self) -> IndexFieldPath;

    /// One statement (or error) per index, plus a primary index if none exists.
    fn destination_index_statements(&self, keyspace: &Keyspace) -> Vec<DestinationIndex>;
}

/// Create a source connector from configuration.
pub fn create_source(config: &SourceConfig, retry: RetryConfig) -> Result<Box<dyn Source>> {
    match config {
        SourceConfig::MongoDb(cfg) => Ok(Box::new(mongodb::MongoDbSource::new(
            cfg.clone(),
            retry,
        )?)),
        SourceConfig::DynamoDb(cfg) => Ok(Box::new(dynamodb::DynamoDbSource::new(cfg.clone()))),
    }
}

/// Create the Couchbase destination from configuration.
pub fn create_destination(
    config: &couchbase::CouchbaseConfig,
    retry: RetryConfig,
) -> Result<Box<dyn Destination>> {
    let repo = couchbase::RestRepo::new(config, retry)?;
    Ok(Box::new(couchbase::CouchbaseDestination::new(
        config.clone(),
        Box::new(repo),
    )))
}
