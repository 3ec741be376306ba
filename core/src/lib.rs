pub mod config;
pub mod error;
pub mod extract;
pub mod persist;
pub mod pipeline;
pub mod pool;
pub mod reconcile;
pub mod records;
pub mod stages;
pub mod stats;
pub mod table;
pub mod topic;

pub use config::{PipelineConfig, RetryPolicy};
pub use error::{ExtractionError, PipelineError};
pub use pipeline::Pipeline;
pub use records::{Document, ScoreRecord, TermFrequencyRecord, DOCUMENTS_KEY};
pub use table::Tables;

/// Channel names, kept identical to the topics the loader and downstream consumers use.
pub mod topics {
    pub const DOCUMENTS: &str = "Documents";
    pub const TERM_FREQUENCIES: &str = "TermFrequencies";
    pub const TFIDF_SCORE: &str = "TFIDFScore";
    pub const MOST_IMPORTANT_TERM: &str = "MostImportantTerm";
}
