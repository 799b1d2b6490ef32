//! MongoDB source connector.
//!
//! Reads documents and index metadata through the MongoDB Atlas Data API
//! (REST). Documents arrive as extended JSON and are converted back into
//! BSON so ObjectIds, dates and decimals keep their types.

use async_trait::async_trait;
use bson::{Bson, Document};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connectors::common::{create_http_client, handle_http_error, join_url, validate_url};
use crate::connectors::Source;
use crate::error::{Error, Result};
use crate::index::{Index, IndexKey, Predicate};
use crate::key::{DocumentKey, KeyPart};
use crate::retry::{with_retry, RetryConfig};

/// Natural key of every MongoDB document.
pub const ID_FIELD: &str = "_id";

/// Configuration for the MongoDB Data API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoDbConfig {
    /// MongoDB Data API endpoint URL.
    /// Format: https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1
    pub data_api_url: String,
    /// MongoDB Data API key.
    pub api_key: String,
    /// Cluster name as known to the Data API.
    #[serde(default = "default_data_source")]
    pub data_source: String,
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// Documents fetched per request.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Optional filter query (MongoDB query syntax as JSON).
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
}

fn default_data_source() -> String {
    "mongodb-atlas".to_string()
}

fn default_page_size() -> u64 {
    1000
}

/// Request body for the Data API find action.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindRequest {
    data_source: String,
    database: String,
    collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
    sort: serde_json::Value,
    skip: u64,
    limit: u64,
}

/// Request body for the Data API aggregate action.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregateRequest {
    data_source: String,
    database: String,
    collection: String,
    pipeline: Vec<serde_json::Value>,
}

/// Response of both find and aggregate.
#[derive(Debug, Deserialize)]
struct DocumentsResponse {
    documents: Vec<serde_json::Value>,
}

/// MongoDB source.
pub struct MongoDbSource {
    config: MongoDbConfig,
    client: Client,
    retry: RetryConfig,
}

impl MongoDbSource {
    /// Creates a new MongoDB source.
    ///
    /// # Errors
    ///
    /// Returns an error if the Data API URL is not an HTTP(S) URL.
    pub fn new(config: MongoDbConfig, retry: RetryConfig) -> Result<Self> {
        validate_url(&config.data_api_url)?;
        Ok(Self {
            config,
            client: create_http_client(false),
            retry,
        })
    }

    /// Builds the API URL for a specific action.
    fn build_url(&self, action: &str) -> String {
        join_url(&self.config.data_api_url, &format!("action/{}", action))
    }

    /// Makes a POST request to the MongoDB Data API.
    async fn api_request<T: Serialize + Sync>(
        &self,
        action: &str,
        body: &T,
    ) -> Result<Vec<serde_json::Value>> {
        let url = self.build_url(action);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("MongoDB API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(handle_http_error(status.as_u16(), &body, "MongoDB"));
        }

        let parsed: DocumentsResponse = response
            .json()
            .await
            .map_err(|e| Error::Extraction(format!("Failed to parse MongoDB response: {}", e)))?;
        Ok(parsed.documents)
    }

    async fn aggregate(&self, pipeline: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>> {
        let request = AggregateRequest {
            data_source: self.config.data_source.clone(),
            database: self.config.database.clone(),
            collection: self.config.collection.clone(),
            pipeline,
        };
        with_retry(&self.retry, "MongoDB aggregate", || {
            self.api_request("aggregate", &request)
        })
        .await
    }

    fn find_request(&self, skip: u64, limit: u64) -> FindRequest {
        FindRequest {
            data_source: self.config.data_source.clone(),
            database: self.config.database.clone(),
            collection: self.config.collection.clone(),
            filter: self.config.filter.clone(),
            sort: serde_json::json!({ ID_FIELD: 1 }),
            skip,
            limit,
        }
    }

    /// Fetches a single document to check connectivity and credentials.
    async fn probe(&self) -> Result<()> {
        let request = self.find_request(0, 1);
        with_retry(&self.retry, "MongoDB connect", || {
            self.api_request("find", &request)
        })
        .await
        .map(|_| ())
    }

    async fn fetch_page(&self, skip: u64) -> Result<Vec<Document>> {
        let request = self.find_request(skip, self.config.page_size);
        let documents = with_retry(&self.retry, "MongoDB find", || {
            self.api_request("find", &request)
        })
        .await?;
        documents.into_iter().map(ejson_to_document).collect()
    }
}

/// Converts one extended JSON document into BSON.
pub fn ejson_to_document(value: serde_json::Value) -> Result<Document> {
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(Error::Extraction(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
        Err(e) => Err(Error::Extraction(format!("invalid extended JSON: {}", e))),
    }
}

/// Builds an [`Index`] from an index specification document.
///
/// Features the destination cannot express are recorded on `Index::error`.
pub fn index_from_spec(spec: &Document) -> Index {
    let name = spec.get_str("name").unwrap_or_default().to_string();

    let unsupported = [
        ("weights", "text index is not supported"),
        ("2dsphereIndexVersion", "geospatial index is not supported"),
        ("collation", "index with custom collation is not supported"),
        ("expireAfterSeconds", "TTL index is not supported"),
    ];
    if let Some((_, reason)) = unsupported.iter().find(|(k, _)| spec.contains_key(k)) {
        return Index::not_supported(name, *reason);
    }

    let Ok(key) = spec.get_document("key") else {
        return Index::not_supported(name, "index has no key specification");
    };
    let mut keys = Vec::with_capacity(key.len());
    for (field, value) in key {
        let order = match value {
            Bson::Int32(n) => i64::from(*n),
            Bson::Int64(n) => *n,
            Bson::Double(n) => *n as i64,
            Bson::String(kind) => {
                return Index::not_supported(name, format!("{} index is not supported", kind));
            }
            _ => {
                return Index::not_supported(
                    name,
                    format!("order value of field {} is not a number", field),
                );
            }
        };
        keys.push(IndexKey::new(field, if order < 0 { -1 } else { 1 }));
    }

    let mut index = Index::new(name, keys);
    index.unique = spec.get_bool("unique").unwrap_or(false);
    index.sparse = spec.get_bool("sparse").unwrap_or(false);
    if let Ok(filter) = spec.get_document("partialFilterExpression") {
        match Predicate::parse(filter) {
            Ok(predicate) => index.partial_expression = Some(predicate),
            Err(e) => index.error = Some(e),
        }
    }
    index
}

#[async_trait]
impl Source for MongoDbSource {
    fn source_type(&self) -> &'static str {
        "mongodb"
    }

    async fn init(&mut self, key: &DocumentKey) -> Result<()> {
        // Fails fast on bad credentials or an unknown collection.
        self.probe().await?;
        if key.set(vec![KeyPart::field(ID_FIELD)]) {
            debug!("Using {} as the document key", ID_FIELD);
        }
        Ok(())
    }

    async fn count_hint(&self) -> Option<u64> {
        let mut pipeline = Vec::new();
        if let Some(filter) = &self.config.filter {
            pipeline.push(serde_json::json!({ "$match": filter }));
        }
        pipeline.push(serde_json::json!({ "$count": "total" }));

        self.aggregate(pipeline)
            .await
            .ok()?
            .first()
            .and_then(|doc| doc.get("total"))
            .and_then(serde_json::Value::as_u64)
    }

    async fn stream_data(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<Document>,
    ) -> Result<()> {
        let mut skip = 0;
        loop {
            if cancel.is_cancelled() {
                debug!("MongoDB stream cancelled after {} documents", skip);
                return Ok(());
            }

            let page = self.fetch_page(skip).await?;
            let fetched = page.len() as u64;
            for doc in page {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    sent = tx.send(doc) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            skip += fetched;
            if fetched < self.config.page_size {
                break;
            }
        }
        info!("Read {} documents from MongoDB", skip);
        Ok(())
    }

    async fn get_indexes(&self) -> Result<Vec<Index>> {
        let stats = self
            .aggregate(vec![serde_json::json!({ "$indexStats": {} })])
            .await?;

        let mut indexes = Vec::with_capacity(stats.len());
        for stat in stats {
            let stat = ejson_to_document(stat)?;
            let spec = stat.get_document("spec").map_err(|e| {
                Error::Extraction(format!("index statistics without spec: {}", e))
            })?;
            indexes.push(index_from_spec(spec));
        }
        debug!("Found {} MongoDB indexes", indexes.len());
        Ok(indexes)
    }
}

#[cfg(test)]
#[path = "mongodb_tests.rs"]
mod tests;
