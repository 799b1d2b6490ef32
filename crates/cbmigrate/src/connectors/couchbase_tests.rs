//! Tests for the Couchbase destination connector.

use super::*;
use crate::index::CompileError;
use crate::key::KeyPart;
use bson::doc;
use serde_json::json;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{basic_auth, body_partial_json, body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(url: &str) -> CouchbaseConfig {
    CouchbaseConfig {
        management_url: url.to_string(),
        query_url: url.to_string(),
        username: "admin".to_string(),
        password: "password".to_string(),
        bucket: "travel".to_string(),
        scope: "inventory".to_string(),
        collection: "airlines".to_string(),
        generated_key: None,
        hash_document_key: None,
        keep_primary_key: false,
        batch_size: 2,
        accept_invalid_certs: false,
    }
}

#[derive(Default)]
struct FakeState {
    ensured: Vec<Keyspace>,
    batches: Vec<Vec<(String, Value)>>,
    statements: Vec<String>,
    failing_statement: Option<String>,
    rejections: Vec<UpsertFailure>,
}

#[derive(Clone, Default)]
struct FakeRepo {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl CouchbaseRepo for FakeRepo {
    async fn ensure_collection(&self, keyspace: &Keyspace) -> Result<()> {
        self.state.lock().unwrap().ensured.push(keyspace.clone());
        Ok(())
    }

    async fn upsert_batch(
        &self,
        _keyspace: &Keyspace,
        docs: &[(String, Value)],
    ) -> Result<Vec<UpsertFailure>> {
        let mut state = self.state.lock().unwrap();
        state.batches.push(docs.to_vec());
        Ok(std::mem::take(&mut state.rejections))
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(statement.to_string());
        match &state.failing_statement {
            Some(s) if statement.contains(s.as_str()) => {
                Err(Error::DestinationConnection("index exists".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn destination(config: CouchbaseConfig) -> (CouchbaseDestination, FakeRepo) {
    let repo = FakeRepo::default();
    (CouchbaseDestination::new(config, Box::new(repo.clone())), repo)
}

fn id_key() -> DocumentKey {
    let key = DocumentKey::new();
    key.set(vec![KeyPart::field("_id")]);
    key
}

// ==================== Destination ====================

#[tokio::test]
async fn test_init_installs_generator_and_provisions() {
    // Arrange
    let mut config = test_config("http://localhost:8091");
    config.generated_key = Some("airline::%iata%".to_string());
    let (mut dest, repo) = destination(config);
    let key = DocumentKey::new();

    // Act
    dest.init(&key).await.unwrap();

    // Assert
    assert_eq!(
        key.parts(),
        &[KeyPart::literal("airline::"), KeyPart::field("iata")]
    );
    assert_eq!(
        repo.state.lock().unwrap().ensured,
        vec![Keyspace::new("travel", "inventory", "airlines")]
    );
}

#[tokio::test]
async fn test_init_rejects_bad_generator() {
    let mut config = test_config("http://localhost:8091");
    config.generated_key = Some("%iata%::#SEQ#".to_string());
    let (mut dest, repo) = destination(config);

    let result = dest.init(&DocumentKey::new()).await;

    assert!(matches!(result, Err(Error::KeyGeneration(_))));
    assert!(repo.state.lock().unwrap().ensured.is_empty());
}

#[tokio::test]
async fn test_process_data_flushes_full_batches() {
    // Arrange
    let (mut dest, repo) = destination(test_config("http://localhost:8091"));
    dest.init(&id_key()).await.unwrap();

    // Act
    for i in 1..=5 {
        dest.process_data(doc! { "_id": i, "n": i }).await.unwrap();
    }
    let before_complete = repo.state.lock().unwrap().batches.len();
    dest.complete().await.unwrap();

    // Assert
    let state = repo.state.lock().unwrap();
    assert_eq!(before_complete, 2);
    let sizes: Vec<usize> = state.batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(state.batches[2][0].0, "5");
    assert_eq!(dest.processed(), 5);
    assert_eq!(dest.batches_written(), 3);
}

#[tokio::test]
async fn test_complete_without_documents_writes_nothing() {
    let (mut dest, repo) = destination(test_config("http://localhost:8091"));
    dest.init(&id_key()).await.unwrap();

    dest.complete().await.unwrap();

    assert!(repo.state.lock().unwrap().batches.is_empty());
}

#[tokio::test]
async fn test_single_field_key_is_removed_from_body() {
    let mut config = test_config("http://localhost:8091");
    config.batch_size = 1;
    let (mut dest, repo) = destination(config);
    dest.init(&id_key()).await.unwrap();

    dest.process_data(doc! { "_id": "a1", "name": "Air One" })
        .await
        .unwrap();

    let state = repo.state.lock().unwrap();
    assert_eq!(state.batches[0][0], ("a1".to_string(), json!({ "name": "Air One" })));
}

#[tokio::test]
async fn test_keep_primary_key_keeps_body_intact() {
    let mut config = test_config("http://localhost:8091");
    config.batch_size = 1;
    config.keep_primary_key = true;
    let (mut dest, repo) = destination(config);
    dest.init(&id_key()).await.unwrap();

    dest.process_data(doc! { "_id": "a1", "name": "Air One" })
        .await
        .unwrap();

    let state = repo.state.lock().unwrap();
    assert_eq!(state.batches[0][0].1, json!({ "_id": "a1", "name": "Air One" }));
}

#[tokio::test]
async fn test_hashed_key_keeps_source_field() {
    let mut config = test_config("http://localhost:8091");
    config.batch_size = 1;
    config.generated_key = Some("%iata%".to_string());
    config.hash_document_key = Some(HashAlgorithm::Sha256);
    let (mut dest, repo) = destination(config);
    dest.init(&DocumentKey::new()).await.unwrap();

    dest.process_data(doc! { "iata": "AF" }).await.unwrap();

    let state = repo.state.lock().unwrap();
    let (id, body) = &state.batches[0][0];
    assert_eq!(id, &HashAlgorithm::Sha256.digest("AF"));
    assert_eq!(id.len(), 64);
    assert_eq!(body, &json!({ "iata": "AF" }));
}

#[tokio::test]
async fn test_compound_key_keeps_fields() {
    let mut config = test_config("http://localhost:8091");
    config.batch_size = 1;
    config.generated_key = Some("%country%::%iata%".to_string());
    let (mut dest, repo) = destination(config);
    dest.init(&DocumentKey::new()).await.unwrap();

    dest.process_data(doc! { "country": "FR", "iata": "AF" })
        .await
        .unwrap();

    let state = repo.state.lock().unwrap();
    assert_eq!(state.batches[0][0].0, "FR::AF");
    assert_eq!(state.batches[0][0].1, json!({ "country": "FR", "iata": "AF" }));
}

#[tokio::test]
async fn test_empty_key_is_an_error() {
    let mut config = test_config("http://localhost:8091");
    config.generated_key = Some("%iata%".to_string());
    let (mut dest, _repo) = destination(config);
    dest.init(&DocumentKey::new()).await.unwrap();

    let result = dest.process_data(doc! { "name": "no code" }).await;

    assert!(matches!(result, Err(Error::KeyGeneration(_))));
}

#[tokio::test]
async fn test_rejected_documents_do_not_stop_the_run() {
    let (mut dest, repo) = destination(test_config("http://localhost:8091"));
    dest.init(&id_key()).await.unwrap();
    repo.state.lock().unwrap().rejections.push(UpsertFailure {
        code: 12009,
        message: "DML Error".to_string(),
    });

    dest.process_data(doc! { "_id": 1 }).await.unwrap();
    dest.process_data(doc! { "_id": 2 }).await.unwrap();
    dest.process_data(doc! { "_id": 3 }).await.unwrap();
    dest.complete().await.unwrap();

    assert_eq!(repo.state.lock().unwrap().batches.len(), 2);
}

#[tokio::test]
async fn test_create_indexes_reports_each_outcome() {
    // Arrange
    let (dest, repo) = destination(test_config("http://localhost:8091"));
    repo.state.lock().unwrap().failing_statement = Some("`dup`".to_string());
    let indexes = vec![
        DestinationIndex::compiled("ok", "CREATE INDEX `ok` ON ks(`a`)"),
        DestinationIndex::compiled("dup", "CREATE INDEX `dup` ON ks(`b`)"),
        DestinationIndex::failed("text", CompileError::NotSupported("text index".to_string())),
        DestinationIndex::failed("bad", CompileError::UnknownType("regex".to_string())),
    ];

    // Act
    let report = dest.create_indexes(&indexes).await.unwrap();

    // Assert
    assert_eq!(
        report,
        IndexReport {
            created: 1,
            skipped: 1,
            failed: 2,
        }
    );
    let state = repo.state.lock().unwrap();
    assert_eq!(state.statements.len(), 3);
    assert!(state.statements[2].starts_with("BUILD INDEX ON `travel`.`inventory`.`airlines`"));
}

// ==================== REST repo ====================

fn rest_repo(server: &MockServer) -> RestRepo {
    RestRepo::new(&test_config(&server.uri()), RetryConfig::no_retry()).unwrap()
}

#[test]
fn test_upsert_statement_numbers_parameters() {
    let ks = Keyspace::new("b", "s", "c");
    assert_eq!(
        upsert_statement(&ks, 2),
        "UPSERT INTO `b`.`s`.`c` (KEY, VALUE) VALUES ($1, $2), ($3, $4)"
    );
}

#[test]
fn test_rest_repo_rejects_bad_url() {
    let mut config = test_config("http://localhost:8091");
    config.query_url = "couchbase://localhost".to_string();
    assert!(RestRepo::new(&config, RetryConfig::no_retry()).is_err());
}

#[tokio::test]
async fn test_ensure_collection_creates_missing_scope_and_collection() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pools/default/buckets/travel/scopes"))
        .and(basic_auth("admin", "password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "scopes": [ { "name": "_default", "collections": [ { "name": "_default" } ] } ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pools/default/buckets/travel/scopes"))
        .and(body_string("name=inventory"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pools/default/buckets/travel/scopes/inventory/collections"))
        .and(body_string("name=airlines"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Act
    let result = rest_repo(&server)
        .ensure_collection(&Keyspace::new("travel", "inventory", "airlines"))
        .await;

    // Assert
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_ensure_collection_keeps_existing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pools/default/buckets/travel/scopes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "scopes": [ { "name": "inventory", "collections": [ { "name": "airlines" } ] } ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = rest_repo(&server)
        .ensure_collection(&Keyspace::new("travel", "inventory", "airlines"))
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_ensure_collection_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let result = rest_repo(&server)
        .ensure_collection(&Keyspace::new("travel", "inventory", "airlines"))
        .await;

    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[tokio::test]
async fn test_upsert_batch_sends_positional_args() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .and(body_partial_json(json!({
            "statement": "UPSERT INTO `travel`.`inventory`.`airlines` (KEY, VALUE) VALUES ($1, $2), ($3, $4)",
            "args": [ "k1", { "n": 1 }, "k2", { "n": 2 } ]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "status": "success", "results": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let docs = vec![
        ("k1".to_string(), json!({ "n": 1 })),
        ("k2".to_string(), json!({ "n": 2 })),
    ];

    // Act
    let failures = rest_repo(&server)
        .upsert_batch(&Keyspace::new("travel", "inventory", "airlines"), &docs)
        .await
        .unwrap();

    // Assert
    assert!(failures.is_empty());
}

#[tokio::test]
async fn test_upsert_batch_returns_document_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "errors",
            "errors": [ { "code": 12009, "msg": "DML Error, possible causes include CAS mismatch" } ]
        })))
        .mount(&server)
        .await;

    let failures = rest_repo(&server)
        .upsert_batch(
            &Keyspace::new("travel", "inventory", "airlines"),
            &[("k1".to_string(), json!({}))],
        )
        .await
        .unwrap();

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, 12009);
}

#[tokio::test]
async fn test_upsert_batch_request_failure_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "status": "fatal",
            "errors": [ { "code": 5000, "msg": "internal error" } ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = rest_repo(&server)
        .upsert_batch(
            &Keyspace::new("travel", "inventory", "airlines"),
            &[("k1".to_string(), json!({}))],
        )
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Write(_)));
    assert!(err.to_string().contains("internal error"));
}

#[tokio::test]
async fn test_execute_reports_statement_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .and(body_partial_json(json!({ "statement": "CREATE INDEX `a` ON ks(`a`)" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "errors",
            "errors": [ { "code": 4300, "msg": "The index a already exists." } ]
        })))
        .mount(&server)
        .await;

    let result = rest_repo(&server).execute("CREATE INDEX `a` ON ks(`a`)").await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::DestinationConnection(_)));
    assert!(err.to_string().contains("already exists"));
}
