//! Configuration types for cbmigrate.

use serde::{Deserialize, Serialize};

use crate::connectors::couchbase::CouchbaseConfig;
use crate::connectors::dynamodb::DynamoDbConfig;
use crate::connectors::mongodb::MongoDbConfig;
use crate::error::{Error, Result};
use crate::key::parse_generator;
use crate::retry::RetryConfig;

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source database configuration.
    pub source: SourceConfig,
    /// Destination Couchbase configuration.
    pub destination: CouchbaseConfig,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Source database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// MongoDB through the Atlas Data API.
    #[serde(rename = "mongodb")]
    MongoDb(MongoDbConfig),
    /// DynamoDB table export.
    #[serde(rename = "dynamodb")]
    DynamoDb(DynamoDbConfig),
}

impl SourceConfig {
    /// Source type name as written in the configuration.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceConfig::MongoDb(_) => "mongodb",
            SourceConfig::DynamoDb(_) => "dynamodb",
        }
    }
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Migrate secondary indexes after the documents.
    #[serde(default = "default_true")]
    pub copy_indexes: bool,
    /// Capacity of the queue between the source and the destination.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Documents sampled per index field path.
    #[serde(default = "default_index_sample_size")]
    pub index_sample_size: usize,
    /// Retries for idempotent network calls.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            copy_indexes: true,
            buffer_size: default_buffer_size(),
            index_sample_size: default_index_sample_size(),
            max_retries: default_max_retries(),
        }
    }
}

impl MigrationOptions {
    /// Retry policy derived from `max_retries`.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_index_sample_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.destination.bucket.is_empty() {
            return Err(Error::Config("bucket name cannot be empty".to_string()));
        }
        if self.destination.collection.is_empty() {
            return Err(Error::Config("collection name cannot be empty".to_string()));
        }
        if self.destination.batch_size == 0 {
            return Err(Error::Config(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.options.buffer_size == 0 {
            return Err(Error::Config(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if let Some(expr) = &self.destination.generated_key {
            parse_generator(expr)?;
        }
        match &self.source {
            SourceConfig::MongoDb(cfg) => {
                if cfg.page_size == 0 {
                    return Err(Error::Config(
                        "page_size must be greater than 0".to_string(),
                    ));
                }
                if cfg.database.is_empty() || cfg.collection.is_empty() {
                    return Err(Error::Config(
                        "mongodb database and collection are required".to_string(),
                    ));
                }
            }
            SourceConfig::DynamoDb(cfg) => {
                if cfg.items.as_os_str().is_empty() {
                    return Err(Error::Config("dynamodb items path is required".to_string()));
                }
            }
        }
        Ok(())
    }
}
