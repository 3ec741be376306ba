//! Wiring of the three stages into a running pipeline.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::extract::EntityExtractor;
use crate::pool::ExtractionPool;
use crate::records::ScoreRecord;
use crate::stages::{run_partition, InverseDocumentFrequencyStage, MaximumTrackingStage, Stage, TermFrequencyStage};
use crate::stats::PipelineStats;
use crate::table::Tables;
use crate::topic::{Envelope, Subscription, Topic};
use crate::topics;

/// Documents -> TermFrequencies -> TFIDFScore -> MostImportantTerm.
///
/// Every stage runs one worker per partition. Dropping the last handle to the
/// Documents channel (see [`Pipeline::shutdown`]) lets the stages drain in order.
pub struct Pipeline {
    documents: Topic,
    most_important: Option<Subscription<ScoreRecord>>,
    workers: Vec<JoinHandle<Result<(), PipelineError>>>,
    tables: Tables,
    stats: PipelineStats,
}

impl Pipeline {
    /// Spawn all partition workers on the current tokio runtime.
    pub fn spawn(config: PipelineConfig, tables: Tables, extractor: Arc<dyn EntityExtractor>) -> Self {
        let config = config.normalized();
        let stats = PipelineStats::default();
        let pool = ExtractionPool::new(extractor, config.extract_workers, config.allowed_categories.clone(), config.max_chars)
            .with_timeout(config.extract_timeout);

        let (documents, document_rx) = Topic::new(topics::DOCUMENTS, config.partitions, config.channel_capacity);
        let (term_frequencies, tf_rx) = Topic::new(topics::TERM_FREQUENCIES, config.partitions, config.channel_capacity);
        let (scores, score_rx) = Topic::new(topics::TFIDF_SCORE, config.partitions, config.channel_capacity);
        let (most_important, mut most_important_rx) = Topic::new(topics::MOST_IMPORTANT_TERM, 1, config.channel_capacity);

        let tf_stage = Arc::new(TermFrequencyStage::new(pool, tables.clone(), term_frequencies, Arc::clone(&stats.term_frequency)));
        let idf_stage = Arc::new(InverseDocumentFrequencyStage::new(
            tables.document_frequency.reader(),
            tables.document_count.reader(),
            scores,
            Arc::clone(&stats.inverse_document_frequency),
        ));
        let max_stage = Arc::new(MaximumTrackingStage::new(&tables, most_important, Arc::clone(&stats.maximum_tracking)));

        let mut workers = Vec::with_capacity(config.partitions * 3);
        spawn_workers(&mut workers, tf_stage, document_rx, config.retry);
        spawn_workers(&mut workers, idf_stage, tf_rx, config.retry);
        spawn_workers(&mut workers, max_stage, score_rx, config.retry);

        tracing::info!(partitions = config.partitions, extract_workers = config.extract_workers, "pipeline started");
        Self {
            documents,
            most_important: Some(Subscription::new(topics::MOST_IMPORTANT_TERM, most_important_rx.remove(0))),
            workers,
            tables,
            stats,
        }
    }

    /// Publish a document onto the Documents channel.
    pub async fn submit(&self, key: &str, text: &str) -> Result<(), PipelineError> {
        self.documents.send_raw(key, text.as_bytes().to_vec()).await
    }

    /// A sender for the Documents channel. The pipeline only drains once every
    /// clone is dropped.
    pub fn documents(&self) -> Topic {
        self.documents.clone()
    }

    /// The MostImportantTerm channel. Must be drained, or the maximum-tracking
    /// workers stall once it is full. Can be taken once.
    pub fn take_most_important(&mut self) -> Option<Subscription<ScoreRecord>> {
        self.most_important.take()
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Close the Documents channel and wait for every worker to drain.
    /// Returns the first error a worker stopped with.
    pub async fn shutdown(self) -> Result<Tables, PipelineError> {
        let Self { documents, most_important, workers, tables, .. } = self;
        drop(documents);
        // an untaken output channel would block the last stage forever
        let drain = most_important.map(|mut subscription| {
            tokio::spawn(async move { while subscription.recv().await.is_some() {} })
        });

        let mut first_error = None;
        for worker in workers {
            let result = match worker.await {
                Ok(result) => result,
                Err(join) => Err(PipelineError::Worker(join.to_string())),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        tracing::info!("pipeline stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(tables),
        }
    }
}

fn spawn_workers<S: Stage>(
    workers: &mut Vec<JoinHandle<Result<(), PipelineError>>>,
    stage: Arc<S>,
    receivers: Vec<tokio::sync::mpsc::Receiver<Envelope>>,
    retry: RetryPolicy,
) {
    for (partition, rx) in receivers.into_iter().enumerate() {
        workers.push(tokio::spawn(run_partition(Arc::clone(&stage), partition, rx, retry)));
    }
}
