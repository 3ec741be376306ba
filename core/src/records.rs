use serde::{Deserialize, Serialize};

/// Key of the single DocumentCount entry.
pub const DOCUMENTS_KEY: &str = "documents";

/// A document as published on the Documents channel by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub text: String,
}

/// Emitted once per distinct term per document by the term-frequency stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermFrequencyRecord {
    pub document: String,
    pub term: String,
    pub tf: f64,
    /// DocumentFrequency[term] right after this document was counted.
    pub document_frequency: u64,
    /// DocumentCount right after this document was counted.
    pub document_count: u64,
}

/// A candidate score (TFIDFScore) or a confirmed maximum (MostImportantTerm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub document: String,
    pub term: String,
    pub tfidf: f64,
}

/// Shape checks applied after a record is decoded from a channel.
pub trait Record {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Record for TermFrequencyRecord {
    fn validate(&self) -> Result<(), String> {
        if !self.tf.is_finite() || self.tf <= 0.0 || self.tf > 1.0 {
            return Err(format!("tf {} outside (0, 1]", self.tf));
        }
        if self.document_frequency == 0 {
            return Err("document_frequency snapshot must be at least 1".into());
        }
        if self.document_count == 0 {
            return Err("document_count snapshot must be at least 1".into());
        }
        Ok(())
    }
}

impl Record for ScoreRecord {
    fn validate(&self) -> Result<(), String> {
        if self.tfidf.is_finite() { Ok(()) } else { Err(format!("tfidf {} is not finite", self.tfidf)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf_record(tf: f64, df: u64, count: u64) -> TermFrequencyRecord {
        TermFrequencyRecord { document: "d1".into(), term: "John Doe".into(), tf, document_frequency: df, document_count: count }
    }

    #[test]
    fn rejects_zero_snapshots() {
        assert!(tf_record(0.5, 0, 3).validate().is_err());
        assert!(tf_record(0.5, 1, 0).validate().is_err());
        assert!(tf_record(0.5, 1, 1).validate().is_ok());
    }

    #[test]
    fn rejects_tf_outside_unit_interval() {
        assert!(tf_record(0.0, 1, 1).validate().is_err());
        assert!(tf_record(1.5, 1, 1).validate().is_err());
        assert!(tf_record(f64::NAN, 1, 1).validate().is_err());
        assert!(tf_record(1.0, 1, 1).validate().is_ok());
    }

    #[test]
    fn record_field_names_on_the_wire() {
        let json = serde_json::to_value(tf_record(0.25, 2, 7)).unwrap();
        assert_eq!(json["document_frequency"], 2);
        assert_eq!(json["document_count"], 7);
    }
}
