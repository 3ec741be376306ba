//! The three pipeline stages and the partition worker loop that drives them.

mod idf;
mod max;
mod tf;

pub use idf::InverseDocumentFrequencyStage;
pub use max::{MaxOutcome, MaximumTrackingStage};
pub use tf::TermFrequencyStage;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::stats::StageStats;
use crate::topic::Envelope;

pub trait Stage: Send + Sync + 'static {
    type Input: Send + Sync;

    /// Name of the channel this stage consumes.
    const TOPIC: &'static str;

    fn stats(&self) -> &StageStats;

    fn decode(&self, envelope: &Envelope) -> Result<Self::Input, PipelineError>;

    /// Process one message. Must leave no table change behind when it fails
    /// with a retryable error.
    fn handle(&self, key: &str, input: &Self::Input) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// Consume one partition in arrival order until its channel closes.
///
/// Malformed messages are logged and dropped. Retryable failures are redelivered
/// per `retry`; when a bounded policy runs out, the worker stops and returns the
/// error, as it does for any other failure. No failed message is acknowledged.
pub async fn run_partition<S: Stage>(
    stage: Arc<S>,
    partition: usize,
    mut rx: mpsc::Receiver<Envelope>,
    retry: RetryPolicy,
) -> Result<(), PipelineError> {
    tracing::debug!(topic = S::TOPIC, partition, "partition worker started");
    while let Some(envelope) = rx.recv().await {
        stage.stats().record_received();
        let input = match stage.decode(&envelope) {
            Ok(input) => input,
            Err(err) => {
                tracing::error!(topic = S::TOPIC, partition, key = %envelope.key, error = %err, "dropping malformed record");
                stage.stats().record_malformed();
                continue;
            }
        };
        let mut attempt = 1;
        loop {
            match stage.handle(&envelope.key, &input).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() && retry.allows_retry(attempt) => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(topic = S::TOPIC, partition, key = %envelope.key, attempt, ?delay, error = %err, "redelivering message");
                    stage.stats().record_retried();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::error!(topic = S::TOPIC, partition, key = %envelope.key, attempt, error = %err, "retries exhausted, partition worker stopped");
                    stage.stats().record_failed();
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(topic = S::TOPIC, partition, key = %envelope.key, error = %err, "partition worker stopped");
                    stage.stats().record_failed();
                    return Err(err);
                }
            }
        }
    }
    tracing::debug!(topic = S::TOPIC, partition, "partition worker finished");
    Ok(())
}
