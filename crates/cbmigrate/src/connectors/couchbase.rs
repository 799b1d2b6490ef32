//! Couchbase destination connector.
//!
//! Documents are written in batches with `UPSERT` statements through the
//! query service, and the target scope and collection are provisioned
//! through the cluster management REST API. The wire calls sit behind
//! [`CouchbaseRepo`] so batching, keying and index bookkeeping can be
//! exercised without a cluster.

use async_trait::async_trait;
use bson::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::connectors::common::{
    create_http_client, handle_destination_error, join_url, validate_url,
};
use crate::connectors::{Destination, IndexReport};
use crate::document::to_json;
use crate::error::{Error, Result};
use crate::index::{build_deferred_statement, DestinationIndex, Keyspace};
use crate::key::{parse_generator, DocumentKey, HashAlgorithm};
use crate::retry::{with_retry, RetryConfig};

/// Couchbase destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchbaseConfig {
    /// Cluster management endpoint.
    #[serde(default = "default_management_url")]
    pub management_url: String,
    /// Query service endpoint.
    #[serde(default = "default_query_url")]
    pub query_url: String,
    /// Cluster user.
    pub username: String,
    /// Cluster password.
    pub password: String,
    /// Target bucket. Must already exist.
    pub bucket: String,
    /// Target scope, created if missing.
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Target collection, created if missing.
    pub collection: String,
    /// Key generator expression, e.g. `airline::%iata%`.
    #[serde(default)]
    pub generated_key: Option<String>,
    /// Hash applied to every rendered key.
    #[serde(default)]
    pub hash_document_key: Option<HashAlgorithm>,
    /// Keep the key field in the body of single-field keys.
    #[serde(default)]
    pub keep_primary_key: bool,
    /// Documents per `UPSERT` statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_management_url() -> String {
    "http://localhost:8091".to_string()
}

fn default_query_url() -> String {
    "http://localhost:8093".to_string()
}

fn default_scope() -> String {
    "_default".to_string()
}

fn default_batch_size() -> usize {
    250
}

impl CouchbaseConfig {
    /// Fully qualified target collection.
    #[must_use]
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }
}

/// A document the destination rejected inside an otherwise successful batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertFailure {
    /// Error code reported by the query service.
    pub code: i64,
    /// Error message.
    pub message: String,
}

/// Wire operations against a Couchbase cluster.
#[async_trait]
pub trait CouchbaseRepo: Send + Sync {
    /// Creates the scope and collection of `keyspace` when absent.
    async fn ensure_collection(&self, keyspace: &Keyspace) -> Result<()>;

    /// Upserts `(key, body)` pairs in one request.
    ///
    /// A failed request is an error; per-document rejections are returned.
    async fn upsert_batch(
        &self,
        keyspace: &Keyspace,
        docs: &[(String, Value)],
    ) -> Result<Vec<UpsertFailure>>;

    /// Executes one query statement.
    async fn execute(&self, statement: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ScopesResponse {
    scopes: Vec<ScopeInfo>,
}

#[derive(Debug, Deserialize)]
struct ScopeInfo {
    name: String,
    #[serde(default)]
    collections: Vec<CollectionInfo>,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    name: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    statement: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<QueryError>,
}

#[derive(Debug, Deserialize)]
struct QueryError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// [`CouchbaseRepo`] over the management and query REST services.
pub struct RestRepo {
    client: Client,
    management_url: String,
    query_url: String,
    username: String,
    password: String,
    retry: RetryConfig,
}

impl RestRepo {
    /// Creates a repo for the endpoints in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint is not an HTTP(S) URL.
    pub fn new(config: &CouchbaseConfig, retry: RetryConfig) -> Result<Self> {
        validate_url(&config.management_url)?;
        validate_url(&config.query_url)?;
        Ok(Self {
            client: create_http_client(config.accept_invalid_certs),
            management_url: config.management_url.clone(),
            query_url: config.query_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry,
        })
    }

    fn scopes_url(&self, bucket: &str) -> String {
        join_url(
            &self.management_url,
            &format!("pools/default/buckets/{}/scopes", bucket),
        )
    }

    async fn list_scopes(&self, bucket: &str) -> Result<Vec<ScopeInfo>> {
        let response = self
            .client
            .get(self.scopes_url(bucket))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::DestinationConnection(format!("Couchbase request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(handle_destination_error(status, &body));
        }

        let scopes: ScopesResponse = response.json().await.map_err(|e| {
            Error::DestinationConnection(format!("Failed to parse scope listing: {}", e))
        })?;
        Ok(scopes.scopes)
    }

    async fn create(&self, url: String, name: &str) -> Result<()> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("name", name)])
            .send()
            .await
            .map_err(|e| Error::DestinationConnection(format!("Couchbase request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(handle_destination_error(status, &body));
        }
        Ok(())
    }

    async fn query(&self, statement: &str, args: Vec<Value>) -> Result<QueryResponse> {
        let response = self
            .client
            .post(join_url(&self.query_url, "query/service"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&QueryRequest { statement, args })
            .send()
            .await
            .map_err(|e| Error::DestinationConnection(format!("Couchbase request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let message = serde_json::from_str::<QueryResponse>(&body)
                .ok()
                .and_then(|r| r.errors.into_iter().next())
                .map_or(body, |e| format!("{} (code {})", e.msg, e.code));
            return Err(handle_destination_error(status.as_u16(), &message));
        }
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

/// `UPSERT` statement for `count` documents with positional parameters.
pub fn upsert_statement(keyspace: &Keyspace, count: usize) -> String {
    let values: Vec<String> = (0..count)
        .map(|i| format!("(${}, ${})", 2 * i + 1, 2 * i + 2))
        .collect();
    format!(
        "UPSERT INTO {} (KEY, VALUE) VALUES {}",
        keyspace,
        values.join(", ")
    )
}

#[async_trait]
impl CouchbaseRepo for RestRepo {
    async fn ensure_collection(&self, keyspace: &Keyspace) -> Result<()> {
        let scopes = with_retry(&self.retry, "Couchbase list scopes", || {
            self.list_scopes(&keyspace.bucket)
        })
        .await?;
        let scope = scopes.iter().find(|s| s.name == keyspace.scope);

        if scope.is_none() {
            with_retry(&self.retry, "Couchbase create scope", || {
                self.create(self.scopes_url(&keyspace.bucket), &keyspace.scope)
            })
            .await?;
            info!("Created scope {}.{}", keyspace.bucket, keyspace.scope);
        }

        let has_collection =
            scope.is_some_and(|s| s.collections.iter().any(|c| c.name == keyspace.collection));
        if !has_collection {
            let url = format!(
                "{}/{}/collections",
                self.scopes_url(&keyspace.bucket),
                keyspace.scope
            );
            with_retry(&self.retry, "Couchbase create collection", || {
                self.create(url.clone(), &keyspace.collection)
            })
            .await?;
            info!(
                "Created collection {}.{}.{}",
                keyspace.bucket, keyspace.scope, keyspace.collection
            );
        }
        Ok(())
    }

    async fn upsert_batch(
        &self,
        keyspace: &Keyspace,
        docs: &[(String, Value)],
    ) -> Result<Vec<UpsertFailure>> {
        let statement = upsert_statement(keyspace, docs.len());
        let args = docs
            .iter()
            .flat_map(|(key, body)| [Value::String(key.clone()), body.clone()])
            .collect();

        let response = self
            .query(&statement, args)
            .await
            .map_err(|e| Error::Write(e.to_string()))?;

        Ok(response
            .errors
            .into_iter()
            .map(|e| UpsertFailure {
                code: e.code,
                message: e.msg,
            })
            .collect())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let response = with_retry(&self.retry, "Couchbase query", || {
            self.query(statement, Vec::new())
        })
        .await?;

        match response.errors.into_iter().next() {
            Some(e) if response.status != "success" => Err(Error::DestinationConnection(format!(
                "{} (code {})",
                e.msg, e.code
            ))),
            _ => Ok(()),
        }
    }
}

/// Couchbase destination.
pub struct CouchbaseDestination {
    config: CouchbaseConfig,
    repo: Box<dyn CouchbaseRepo>,
    key: DocumentKey,
    batch: Vec<(String, Value)>,
    processed: u64,
    batches: u64,
}

impl CouchbaseDestination {
    /// Creates a destination writing through `repo`.
    pub fn new(config: CouchbaseConfig, repo: Box<dyn CouchbaseRepo>) -> Self {
        let batch = Vec::with_capacity(config.batch_size);
        Self {
            config,
            repo,
            key: DocumentKey::new(),
            batch,
            processed: 0,
            batches: 0,
        }
    }

    /// Documents accepted so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Renders the destination key and strips the key field when redundant.
    fn prepare(&self, mut doc: Document) -> Result<(String, Value)> {
        let mut id = self.key.render(&doc);
        if id.is_empty() {
            return Err(Error::KeyGeneration(format!(
                "empty key rendered from {:?}",
                self.key.parts()
            )));
        }

        match self.config.hash_document_key {
            Some(algorithm) => id = algorithm.digest(&id),
            None => {
                if !self.config.keep_primary_key {
                    if let Some(field) = self.key.non_compound_primary_key() {
                        doc.remove(field);
                    }
                }
            }
        }
        Ok((id, to_json(&doc)))
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let keyspace = self.keyspace();
        let failures = self.repo.upsert_batch(&keyspace, &self.batch).await?;
        for failure in &failures {
            warn!(
                "Document rejected by Couchbase: {} (code {})",
                failure.message, failure.code
            );
        }

        self.batches += 1;
        info!("Processed {} documents", self.processed);
        if let Some((last, _)) = self.batch.last() {
            debug!("Last document key {}", last);
        }
        self.batch.clear();
        Ok(())
    }
}

#[async_trait]
impl Destination for CouchbaseDestination {
    async fn init(&mut self, key: &DocumentKey) -> Result<()> {
        if let Some(expr) = &self.config.generated_key {
            if !key.set(parse_generator(expr)?) {
                warn!("Document key already set, ignoring generator {}", expr);
            }
        }
        self.key = key.clone();
        self.repo.ensure_collection(&self.keyspace()).await
    }

    fn keyspace(&self) -> Keyspace {
        self.config.keyspace()
    }

    async fn process_data(&mut self, doc: Document) -> Result<()> {
        let entry = self.prepare(doc)?;
        self.batch.push(entry);
        self.processed += 1;
        if self.batch.len() >= self.config.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.flush().await
    }

    fn batches_written(&self) -> u64 {
        self.batches
    }

    async fn create_indexes(&self, indexes: &[DestinationIndex]) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        for index in indexes {
            match &index.statement {
                Err(e) if e.is_not_supported() => {
                    warn!("Index {} skipped: {}", index.name, e);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("Index {} could not be translated: {}", index.name, e);
                    report.failed += 1;
                }
                Ok(statement) => match self.repo.execute(statement).await {
                    Ok(()) => {
                        debug!("Created index {}: {}", index.name, statement);
                        report.created += 1;
                    }
                    Err(e) => {
                        error!("Index {} failed: {} ({})", index.name, e, statement);
                        report.failed += 1;
                    }
                },
            }
        }

        let build = build_deferred_statement(&self.keyspace());
        match self.repo.execute(&build).await {
            Ok(()) => info!("Building deferred indexes in the background"),
            Err(e) => error!("Failed to build deferred indexes: {}", e),
        }
        Ok(report)
    }
}

#[cfg(test)]
#[path = "couchbase_tests.rs"]
mod tests;
