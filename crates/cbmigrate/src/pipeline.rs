//! Migration pipeline orchestration.
//!
//! A run moves through `Init → Streaming → Indexing → Done`. Any phase can
//! end in `Failed`. Streaming runs a producer (source → queue) and a
//! consumer (queue → analyzer → destination) concurrently over a bounded
//! channel and joins the errors of both halves.

use std::fmt;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{MigrationConfig, MigrationOptions};
use crate::connectors::{
    create_destination, create_source, Analyzer, Destination, IndexReport, Source,
};
use crate::error::{Error, Result};
use crate::index::FieldPathAnalyzer;
use crate::key::DocumentKey;

/// Migration statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MigrationStats {
    /// Documents handed to the destination.
    pub documents: u64,
    /// Bulk writes issued.
    pub batches: u64,
    /// Index statements executed successfully.
    pub indexes_created: u64,
    /// Indexes skipped as not supported.
    pub indexes_skipped: u64,
    /// Indexes that failed to compile or execute.
    pub indexes_failed: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl MigrationStats {
    /// Calculate throughput (documents per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.documents as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    fn record_indexes(&mut self, report: IndexReport) {
        self.indexes_created = report.created;
        self.indexes_skipped = report.skipped;
        self.indexes_failed = report.failed;
    }
}

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connecting and provisioning.
    Init,
    /// Moving documents.
    Streaming,
    /// Creating destination indexes.
    Indexing,
    /// Finished successfully.
    Done,
    /// Stopped on a fatal error.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Streaming => "streaming",
            Phase::Indexing => "indexing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Migration pipeline.
pub struct Pipeline {
    source: Box<dyn Source>,
    destination: Box<dyn Destination>,
    analyzer: Box<dyn Analyzer>,
    options: MigrationOptions,
    phase: Phase,
    show_progress: bool,
}

impl Pipeline {
    /// Create a pipeline for the connectors named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a connector cannot be created.
    pub fn new(config: &MigrationConfig) -> Result<Self> {
        let retry = config.options.retry_config();
        let source = create_source(&config.source, retry.clone())?;
        let destination = create_destination(&config.destination, retry)?;
        let analyzer = FieldPathAnalyzer::new(config.options.index_sample_size);

        Ok(Self::with_components(
            source,
            destination,
            Box::new(analyzer),
            config.options.clone(),
        ))
    }

    /// Create a pipeline from already constructed collaborators.
    pub fn with_components(
        source: Box<dyn Source>,
        destination: Box<dyn Destination>,
        analyzer: Box<dyn Analyzer>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            destination,
            analyzer,
            options,
            phase: Phase::Init,
            show_progress: true,
        }
    }

    /// Disables the progress bar.
    #[must_use]
    pub fn without_progress(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the migration pipeline.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the phase that failed. Errors raised by
    /// both halves of the stream are joined into [`Error::Multiple`].
    pub async fn run(&mut self) -> Result<MigrationStats> {
        let start = Instant::now();
        let mut stats = MigrationStats::default();

        match self.run_phases(&mut stats).await {
            Ok(()) => {
                self.phase = Phase::Done;
                stats.duration_secs = start.elapsed().as_secs_f64();
                info!(
                    "Migration complete: {} documents in {} batches, {:.2}s ({:.0} docs/sec)",
                    stats.documents,
                    stats.batches,
                    stats.duration_secs,
                    stats.throughput()
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Migration failed during {}: {}", self.phase, e);
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self, stats: &mut MigrationStats) -> Result<()> {
        self.phase = Phase::Init;
        if self.options.buffer_size == 0 {
            return Err(Error::Config(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        let key = self.init().await?;
        debug!("Document key: {:?}", key.parts());

        self.phase = Phase::Streaming;
        info!("Data migration started");
        stats.documents = self.stream().await?;
        stats.batches = self.destination.batches_written();
        info!("Data migration completed");

        if self.options.copy_indexes {
            self.phase = Phase::Indexing;
            info!("Index migration started");
            let report = self.migrate_indexes().await?;
            stats.record_indexes(report);
            info!(
                "Index migration completed: {} created, {} skipped, {} failed",
                report.created, report.skipped, report.failed
            );
        }
        Ok(())
    }

    /// Connects both ends and settles the document key.
    ///
    /// The destination goes first so a configured generator wins over the
    /// source's natural key.
    async fn init(&mut self) -> Result<DocumentKey> {
        let key = DocumentKey::new();
        self.destination.init(&key).await?;
        self.source.init(&key).await?;
        if !key.is_set() {
            return Err(Error::KeyGeneration(format!(
                "{} source offers no natural key and no generated_key is configured",
                self.source.source_type()
            )));
        }

        if self.uses_analyzer() {
            let indexes = self.source.get_indexes().await?;
            info!("Found {} source indexes", indexes.len());
            self.analyzer.init(indexes, key.clone());
        }
        Ok(key)
    }

    /// The analyzer is only fed when it will compile the index statements.
    fn uses_analyzer(&self) -> bool {
        self.options.copy_indexes && !self.source.provides_index_statements()
    }

    async fn stream(&mut self) -> Result<u64> {
        let total = self.source.count_hint().await;
        let progress = if self.show_progress {
            create_progress_bar(total.unwrap_or(0))
        } else {
            ProgressBar::hidden()
        };

        let (tx, mut rx) = mpsc::channel(self.options.buffer_size);
        let cancel = CancellationToken::new();
        let analyze = self.uses_analyzer();

        let source = &self.source;
        let destination = &mut self.destination;
        let analyzer = &mut self.analyzer;

        let producer = source.stream_data(cancel.clone(), tx);
        let bar = progress.clone();
        let consumer = async move {
            let mut count = 0u64;
            while let Some(doc) = rx.recv().await {
                if analyze {
                    analyzer.analyze_data(&doc);
                }
                if let Err(e) = destination.process_data(doc).await {
                    cancel.cancel();
                    return Err(e);
                }
                count += 1;
                bar.inc(1);
            }
            destination.complete().await?;
            Ok(count)
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        progress.finish_and_clear();

        match (produced, consumed) {
            (Ok(()), Ok(count)) => Ok(count),
            (produced, consumed) => {
                let errors = [produced.err(), consumed.err()].into_iter().flatten();
                Err(Error::join(errors)
                    .unwrap_or_else(|| Error::Extraction("stream failed".to_string())))
            }
        }
    }

    async fn migrate_indexes(&self) -> Result<IndexReport> {
        let keyspace = self.destination.keyspace();
        let statements = match self.source.destination_index_statements(&keyspace) {
            Some(statements) => statements,
            None => self.analyzer.destination_index_statements(&keyspace),
        };
        debug!("Compiled {} index statements", statements.len());
        self.destination.create_indexes(&statements).await
    }
}

/// Progress bar for `total` documents, or a spinner when the total is unknown.
pub fn create_progress_bar(total: u64) -> ProgressBar {
    if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} docs ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} docs ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb
    }
}
