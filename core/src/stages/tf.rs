use std::sync::Arc;

use super::Stage;
use crate::error::PipelineError;
use crate::extract::Extraction;
use crate::pool::ExtractionPool;
use crate::records::{TermFrequencyRecord, DOCUMENTS_KEY};
use crate::stats::StageStats;
use crate::table::{Tables, WorkUnit};
use crate::topic::{Envelope, Topic};
use crate::topics;

/// Counts documents and per-term document frequencies, and emits one
/// TermFrequencyRecord per distinct term of each document.
pub struct TermFrequencyStage {
    pool: ExtractionPool,
    tables: Tables,
    output: Topic,
    stats: Arc<StageStats>,
}

impl TermFrequencyStage {
    pub fn new(pool: ExtractionPool, tables: Tables, output: Topic, stats: Arc<StageStats>) -> Self {
        Self { pool, tables, output, stats }
    }

    /// Process one document and return the records it produced.
    ///
    /// Extraction runs first; the tables are only touched once it succeeded, and
    /// all of the document's changes are committed as one unit before anything
    /// is emitted.
    pub async fn process(&self, key: &str, text: &str) -> Result<Vec<TermFrequencyRecord>, PipelineError> {
        let extraction = self.pool.extract(text.to_string()).await?;

        let mut unit = self.tables.changelog.begin();
        let records = match self.count(&mut unit, key, &extraction) {
            Ok(records) => records,
            Err(err) => {
                unit.abort();
                return Err(err);
            }
        };
        unit.commit()?;

        for record in &records {
            self.output.send(key, record).await?;
            tracing::debug!(document = key, term = %record.term, tf = record.tf, document_frequency = record.document_frequency, "term frequency emitted");
        }
        self.stats.record_emitted(records.len() as u64);
        Ok(records)
    }

    fn count(&self, unit: &mut WorkUnit, key: &str, extraction: &Extraction) -> Result<Vec<TermFrequencyRecord>, PipelineError> {
        let document_count = self.tables.document_count.update(unit, DOCUMENTS_KEY, |c| {
            *c += 1;
            *c
        })?;
        self.tables.most_important_score.insert_if_absent(unit, key, 0.0)?;

        let mut records = Vec::with_capacity(extraction.terms.len());
        if extraction.is_empty() {
            tracing::debug!(document = key, document_count, "no entities matched, nothing to emit");
            self.stats.record_skipped();
            return Ok(records);
        }
        let total = extraction.total as f64;
        for (term, &count) in &extraction.terms {
            let document_frequency = self.tables.document_frequency.update(unit, term, |c| {
                *c += 1;
                *c
            })?;
            self.tables.term_occurrence.update(unit, term, |c| *c += count)?;
            records.push(TermFrequencyRecord {
                document: key.to_string(),
                term: term.clone(),
                tf: count as f64 / total,
                document_frequency,
                document_count,
            });
        }
        Ok(records)
    }
}

impl Stage for TermFrequencyStage {
    type Input = String;

    const TOPIC: &'static str = topics::DOCUMENTS;

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    /// Documents travel as raw text; undecodable bytes are replaced rather than rejected.
    fn decode(&self, envelope: &Envelope) -> Result<String, PipelineError> {
        Ok(String::from_utf8_lossy(&envelope.payload).into_owned())
    }

    async fn handle(&self, key: &str, input: &String) -> Result<(), PipelineError> {
        self.process(key, input).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use crate::extract::{EntityExtractor, Extraction, ProperNounExtractor, MAX_CHAR_NUM, PERSON};
    use crate::persist::StateStore;
    use crate::topic::Subscription;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_DOCUMENT: &str = "test document asdas John Doe, and Foo Bar or Foo Bar";

    struct Failing {
        calls: AtomicUsize,
    }

    impl EntityExtractor for Failing {
        fn extract(&self, _text: &str, _allowed: &HashSet<String>) -> Result<Extraction, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExtractionError::Failed("model not loaded".into()))
        }
    }

    fn stage_with(extractor: Arc<dyn EntityExtractor>) -> (TermFrequencyStage, Tables, Subscription<TermFrequencyRecord>) {
        let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
        let pool = ExtractionPool::new(extractor, 1, HashSet::from([PERSON.to_string()]), MAX_CHAR_NUM);
        let (output, mut receivers) = Topic::new(topics::TERM_FREQUENCIES, 1, 16);
        let stage = TermFrequencyStage::new(pool, tables.clone(), output, Arc::default());
        (stage, tables, Subscription::new(topics::TERM_FREQUENCIES, receivers.remove(0)))
    }

    #[tokio::test]
    async fn first_document_emits_normalized_term_frequencies() {
        let (stage, tables, mut output) = stage_with(Arc::new(ProperNounExtractor));
        stage.process("s3://testbucket/test.txt", TEST_DOCUMENT).await.unwrap();

        let john = output.recv().await.unwrap().unwrap();
        let foo = output.recv().await.unwrap().unwrap();
        assert_eq!(john.term, "John Doe");
        assert_eq!(
            foo,
            TermFrequencyRecord {
                document: "s3://testbucket/test.txt".into(),
                term: "Foo Bar".into(),
                tf: 2.0 / 3.0,
                document_frequency: 1,
                document_count: 1,
            }
        );
        assert!((john.tf + foo.tf - 1.0).abs() < 1e-12);
        assert_eq!(tables.term_occurrence.get("Foo Bar"), 2);
        assert_eq!(tables.most_important_score.get("s3://testbucket/test.txt"), 0.0);
    }

    #[tokio::test]
    async fn snapshots_grow_with_each_document() {
        let (stage, tables, _output) = stage_with(Arc::new(ProperNounExtractor));
        stage.process("d1", "Foo Bar").await.unwrap();
        let records = stage.process("d2", "Foo Bar and Jane Roe").await.unwrap();
        let foo = records.iter().find(|r| r.term == "Foo Bar").unwrap();
        assert_eq!((foo.document_frequency, foo.document_count), (2, 2));
        assert_eq!(tables.document_frequency.get("Jane Roe"), 1);
    }

    #[tokio::test]
    async fn document_without_entities_emits_nothing() {
        let (stage, tables, mut output) = stage_with(Arc::new(ProperNounExtractor));
        let records = stage.process("empty", "nothing capitalized here").await.unwrap();
        assert!(records.is_empty());
        assert!(output.try_recv().is_none());
        assert!(tables.most_important_score.contains("empty"));
        assert_eq!(tables.most_important_score.get("empty"), 0.0);
        assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 1);
        assert_eq!(stage.stats().snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn reprocessing_keeps_the_incumbent_score() {
        let (stage, tables, _output) = stage_with(Arc::new(ProperNounExtractor));
        stage.process("d1", "John Doe").await.unwrap();
        let mut unit = tables.changelog.begin();
        tables.most_important_score.update(&mut unit, "d1", |best| *best = 0.7).unwrap();
        stage.process("d1", "John Doe").await.unwrap();
        assert_eq!(tables.most_important_score.get("d1"), 0.7);
        // duplicate delivery is counted twice
        assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 2);
    }

    #[tokio::test]
    async fn failed_extraction_leaves_tables_untouched() {
        let (stage, tables, _output) = stage_with(Arc::new(Failing { calls: AtomicUsize::new(0) }));
        let err = stage.process("d1", TEST_DOCUMENT).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 0);
        assert!(!tables.most_important_score.contains("d1"));
        assert!(tables.changelog.is_empty());
    }
}
