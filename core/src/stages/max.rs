use std::sync::Arc;

use super::Stage;
use crate::error::PipelineError;
use crate::records::ScoreRecord;
use crate::stats::StageStats;
use crate::table::{Changelog, Table, Tables};
use crate::topic::{decode, Envelope, Topic};
use crate::topics;

/// What happened to one candidate score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxOutcome {
    /// The score beat the stored maximum and was published.
    Improved { previous: f64 },
    /// The stored maximum is greater or equal; nothing was published.
    Unchanged { best: f64 },
}

/// Keeps the running maximum per document and publishes strict improvements.
pub struct MaximumTrackingStage {
    most_important_score: Table<f64>,
    changelog: Changelog,
    output: Topic,
    stats: Arc<StageStats>,
}

impl MaximumTrackingStage {
    pub fn new(tables: &Tables, output: Topic, stats: Arc<StageStats>) -> Self {
        Self {
            most_important_score: tables.most_important_score.clone(),
            changelog: tables.changelog.clone(),
            output,
            stats,
        }
    }

    pub async fn process(&self, key: &str, score: &ScoreRecord) -> Result<MaxOutcome, PipelineError> {
        let mut unit = self.changelog.begin();
        let outcome = self.most_important_score.update(&mut unit, &score.document, |best| {
            if score.tfidf > *best {
                let previous = *best;
                *best = score.tfidf;
                MaxOutcome::Improved { previous }
            } else {
                MaxOutcome::Unchanged { best: *best }
            }
        })?;
        unit.commit()?;

        match outcome {
            MaxOutcome::Improved { previous } => {
                self.output.send(key, score).await?;
                self.stats.record_emitted(1);
                tracing::info!(document = %score.document, term = %score.term, tfidf = score.tfidf, previous, "most important term updated");
            }
            MaxOutcome::Unchanged { best } => {
                self.stats.record_suppressed();
                tracing::debug!(document = %score.document, term = %score.term, tfidf = score.tfidf, best, "score does not beat current maximum");
            }
        }
        Ok(outcome)
    }
}

impl Stage for MaximumTrackingStage {
    type Input = ScoreRecord;

    const TOPIC: &'static str = topics::TFIDF_SCORE;

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn decode(&self, envelope: &Envelope) -> Result<ScoreRecord, PipelineError> {
        decode(Self::TOPIC, envelope)
    }

    async fn handle(&self, key: &str, input: &ScoreRecord) -> Result<(), PipelineError> {
        self.process(key, input).await.map(|_| ())
    }
}
