use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::ExtractionError;
use crate::extract::{prepare_document, EntityExtractor, Extraction};

/// Bounded pool running the CPU-bound extractor on blocking threads.
///
/// A slot is held until the extractor call returns, even if the caller stopped
/// waiting because of the timeout, so a stalled call keeps occupying its slot.
#[derive(Clone)]
pub struct ExtractionPool {
    extractor: Arc<dyn EntityExtractor>,
    slots: Arc<Semaphore>,
    allowed_categories: Arc<HashSet<String>>,
    max_chars: usize,
    timeout: Option<Duration>,
}

impl ExtractionPool {
    pub fn new(extractor: Arc<dyn EntityExtractor>, workers: usize, allowed_categories: HashSet<String>, max_chars: usize) -> Self {
        Self {
            extractor,
            slots: Arc::new(Semaphore::new(workers.max(1))),
            allowed_categories: Arc::new(allowed_categories),
            max_chars,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn extract(&self, text: String) -> Result<Extraction, ExtractionError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| ExtractionError::Panicked(e.to_string()))?;
        let extractor = Arc::clone(&self.extractor);
        let allowed = Arc::clone(&self.allowed_categories);
        let max_chars = self.max_chars;
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            extractor.extract(&prepare_document(&text, max_chars), &allowed)
        });
        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| ExtractionError::TimedOut(limit))?,
            None => task.await,
        };
        joined.map_err(|e| ExtractionError::Panicked(e.to_string()))?
    }
}
