// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # cbmigrate
//!
//! `cbmigrate` is a CLI tool and library for migrating documents and
//! secondary indexes from document databases into Couchbase.
//!
//! ## Supported Sources
//!
//! | Source | Documents | Indexes |
//! |--------|-----------|---------|
//! | MongoDB | Atlas Data API | compiled to N1QL, including array paths and partial filters |
//! | DynamoDB | `describe-table` output + JSON-lines export | key schemas mapped 1:1 |
//!
//! ## Quick Start
//!
//! ```bash
//! cbmigrate init --source mongodb --output migration.yaml
//! cbmigrate validate --config migration.yaml
//! cbmigrate --config migration.yaml
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: mongodb
//!   data_api_url: https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1
//!   api_key: your-api-key
//!   database: travel
//!   collection: airlines
//!
//! destination:
//!   username: Administrator
//!   password: password
//!   bucket: travel
//!   scope: inventory
//!   collection: airlines
//!   generated_key: "airline::%_id%"
//!
//! options:
//!   copy_indexes: true
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connectors;
pub mod document;
pub mod error;
pub mod index;
pub mod key;
pub mod pipeline;
pub mod retry;

pub use config::{MigrationConfig, MigrationOptions, SourceConfig};
pub use connectors::{Analyzer, Destination, IndexReport, Source};
pub use error::{Error, Result};
pub use key::{DocumentKey, HashAlgorithm, KeyPart};
pub use pipeline::{MigrationStats, Phase, Pipeline};
