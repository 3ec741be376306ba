use std::sync::Arc;

use super::Stage;
use crate::error::PipelineError;
use crate::reconcile::CounterSnapshot;
use crate::records::{ScoreRecord, TermFrequencyRecord, DOCUMENTS_KEY};
use crate::stats::StageStats;
use crate::table::TableReader;
use crate::topic::{decode, Envelope, Topic};
use crate::topics;

/// Turns term frequencies into TF-IDF scores.
///
/// The live counters are read through read-only handles and may be behind or
/// ahead of the snapshot the record carries; both are merged before scoring.
pub struct InverseDocumentFrequencyStage {
    document_frequency: TableReader<u64>,
    document_count: TableReader<u64>,
    output: Topic,
    stats: Arc<StageStats>,
}

impl InverseDocumentFrequencyStage {
    pub fn new(document_frequency: TableReader<u64>, document_count: TableReader<u64>, output: Topic, stats: Arc<StageStats>) -> Self {
        Self { document_frequency, document_count, output, stats }
    }

    pub fn score(&self, record: &TermFrequencyRecord) -> ScoreRecord {
        let live = CounterSnapshot::new(self.document_frequency.get(&record.term), self.document_count.get(DOCUMENTS_KEY));
        let counters = live.merge(CounterSnapshot::of_record(record));
        ScoreRecord { document: record.document.clone(), term: record.term.clone(), tfidf: record.tf * counters.idf() }
    }

    pub async fn process(&self, key: &str, record: &TermFrequencyRecord) -> Result<ScoreRecord, PipelineError> {
        let score = self.score(record);
        self.output.send(key, &score).await?;
        self.stats.record_emitted(1);
        tracing::debug!(document = %score.document, term = %score.term, tfidf = score.tfidf, "tf-idf emitted");
        Ok(score)
    }
}

impl Stage for InverseDocumentFrequencyStage {
    type Input = TermFrequencyRecord;

    const TOPIC: &'static str = topics::TERM_FREQUENCIES;

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn decode(&self, envelope: &Envelope) -> Result<TermFrequencyRecord, PipelineError> {
        decode(Self::TOPIC, envelope)
    }

    async fn handle(&self, key: &str, input: &TermFrequencyRecord) -> Result<(), PipelineError> {
        self.process(key, input).await.map(|_| ())
    }
}
