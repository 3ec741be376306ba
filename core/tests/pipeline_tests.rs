use nlp_core::extract::{EntityExtractor, Extraction, ProperNounExtractor};
use nlp_core::persist::{StatePaths, StateStore};
use nlp_core::stages::{run_partition, InverseDocumentFrequencyStage, Stage};
use nlp_core::topic::{Subscription, Topic};
use nlp_core::{topics, ExtractionError, Pipeline, PipelineError, PipelineConfig, RetryPolicy, ScoreRecord, Tables, DOCUMENTS_KEY};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Fails the first `failures` calls, then behaves like the proper-noun extractor.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl EntityExtractor for Flaky {
    fn extract(&self, text: &str, allowed: &HashSet<String>) -> Result<Extraction, ExtractionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ExtractionError::Failed("model warming up".into()));
        }
        ProperNounExtractor.extract(text, allowed)
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy { max_attempts, initial_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(4) }
}

async fn drain(mut output: Subscription<ScoreRecord>) -> Vec<ScoreRecord> {
    let mut all = Vec::new();
    while let Some(record) = output.recv().await {
        all.push(record.unwrap());
    }
    all
}

#[tokio::test]
async fn maxima_only_grow_and_match_the_table() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
    let mut pipeline = Pipeline::spawn(PipelineConfig::default(), tables, Arc::new(ProperNounExtractor));
    let collector = tokio::spawn(drain(pipeline.take_most_important().unwrap()));

    pipeline.submit("d1", "Foo Bar spoke to Foo Bar.").await.unwrap();
    pipeline.submit("d2", "Jane Roe").await.unwrap();
    pipeline.submit("d3", "Foo Bar and John Doe met Jane Roe and John Doe").await.unwrap();
    pipeline.submit("empty", "no names in here").await.unwrap();

    let tables = pipeline.shutdown().await.unwrap();
    let emitted = collector.await.unwrap();

    assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 4);
    assert_eq!(tables.document_frequency.get("Foo Bar"), 2);
    assert_eq!(tables.document_frequency.get("Jane Roe"), 2);
    assert_eq!(tables.term_occurrence.get("Foo Bar"), 3);
    assert_eq!(tables.term_occurrence.get("John Doe"), 2);
    assert!(tables.most_important_score.contains("empty"));
    assert_eq!(tables.most_important_score.get("empty"), 0.0);

    // d2 is the second document, so its only term is rarer than the corpus
    let d2: Vec<&ScoreRecord> = emitted.iter().filter(|r| r.document == "d2").collect();
    assert_eq!(d2.len(), 1);
    assert_eq!(d2[0].term, "Jane Roe");
    assert!(d2[0].tfidf > 0.0);

    let mut per_document: HashMap<&str, Vec<f64>> = HashMap::new();
    for record in &emitted {
        per_document.entry(record.document.as_str()).or_default().push(record.tfidf);
    }
    for (document, scores) in per_document {
        assert!(scores.windows(2).all(|w| w[1] > w[0]), "{document}: {scores:?}");
        assert_eq!(tables.most_important_score.get(document), *scores.last().unwrap());
    }
}

#[tokio::test]
async fn extraction_failures_are_redelivered() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
    let config = PipelineConfig { retry: fast_retry(5), ..PipelineConfig::default() };
    let pipeline = Pipeline::spawn(config, tables, Arc::new(Flaky { failures: 2, calls: AtomicUsize::new(0) }));
    pipeline.submit("d1", "John Doe").await.unwrap();
    let stats = pipeline.stats().clone();

    let tables = pipeline.shutdown().await.unwrap();
    let tf = stats.term_frequency.snapshot();
    assert_eq!(tf.retried, 2);
    assert_eq!(tf.failed, 0);
    assert_eq!(tf.emitted, 1);
    // counted once, after the successful attempt
    assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 1);
}

#[tokio::test]
async fn exhausted_retries_stop_the_pipeline_and_commit_nothing() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 2).unwrap();
    let config = PipelineConfig { partitions: 2, retry: fast_retry(3), ..PipelineConfig::default() };
    let pipeline = Pipeline::spawn(config, tables.clone(), Arc::new(Flaky { failures: usize::MAX, calls: AtomicUsize::new(0) }));
    pipeline.submit("d1", "John Doe").await.unwrap();
    let stats = pipeline.stats().clone();

    let err = pipeline.shutdown().await.unwrap_err();
    assert!(matches!(err, PipelineError::Extraction(_)), "{err}");
    let tf = stats.term_frequency.snapshot();
    assert_eq!((tf.retried, tf.failed, tf.emitted), (2, 1, 0));
    assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 0);
    assert!(!tables.most_important_score.contains("d1"));
    assert!(tables.changelog.is_empty());
}

#[tokio::test]
async fn default_policy_keeps_redelivering_until_extraction_succeeds() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
    let mut config = PipelineConfig::default();
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(2);
    let extractor = Arc::new(Flaky { failures: 25, calls: AtomicUsize::new(0) });
    let pipeline = Pipeline::spawn(config, tables, Arc::clone(&extractor) as Arc<dyn EntityExtractor>);
    pipeline.submit("d1", "John Doe").await.unwrap();
    let stats = pipeline.stats().clone();

    let tables = pipeline.shutdown().await.unwrap();
    let tf = stats.term_frequency.snapshot();
    assert_eq!((tf.retried, tf.failed, tf.emitted), (25, 0, 1));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 26);
    assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 1);
    assert_eq!(tables.document_frequency.get("John Doe"), 1);
}

#[tokio::test]
async fn malformed_records_are_dropped_not_fatal() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
    let (scores, mut score_rx) = Topic::new(topics::TFIDF_SCORE, 1, 8);
    let stage = Arc::new(InverseDocumentFrequencyStage::new(
        tables.document_frequency.reader(),
        tables.document_count.reader(),
        scores,
        Arc::default(),
    ));
    let (input, mut input_rx) = Topic::new(topics::TERM_FREQUENCIES, 1, 8);
    input.send_raw("d1", b"not json".to_vec()).await.unwrap();
    input
        .send_raw("d1", br#"{"document":"d1","term":"John Doe","tf":0.5,"document_frequency":0,"document_count":3}"#.to_vec())
        .await
        .unwrap();
    input
        .send_raw("d1", br#"{"document":"d1","term":"John Doe","tf":0.5,"document_frequency":1,"document_count":4}"#.to_vec())
        .await
        .unwrap();
    drop(input);

    run_partition(Arc::clone(&stage), 0, input_rx.remove(0), RetryPolicy::default()).await.unwrap();

    let stats = stage.stats().snapshot();
    assert_eq!((stats.received, stats.malformed, stats.emitted), (3, 2, 1));
    let mut output = Subscription::<ScoreRecord>::new(topics::TFIDF_SCORE, score_rx.remove(0));
    let score = output.try_recv().unwrap().unwrap();
    assert!((score.tfidf - 0.5 * 4f64.ln()).abs() < 1e-12);
}

#[tokio::test]
async fn documents_are_raw_text() {
    let tables = Tables::open(&StateStore::temporary().unwrap(), 1).unwrap();
    let pipeline = Pipeline::spawn(PipelineConfig::default(), tables, Arc::new(ProperNounExtractor));
    pipeline
        .documents()
        .send_raw("latin1", vec![0x4a, 0x6f, 0x68, 0x6e, 0x20, 0x44, 0x6f, 0x65, 0xff])
        .await
        .unwrap();
    let tables = pipeline.shutdown().await.unwrap();
    assert_eq!(tables.document_frequency.get("John Doe"), 1);
}

#[tokio::test]
async fn state_survives_restart_and_checkpoint() {
    let dir = tempdir().unwrap();
    let paths = StatePaths::new(dir.path());

    let expected = {
        let store = StateStore::open(&paths, 2).unwrap();
        let tables = Tables::open(&store, 2).unwrap();
        let config = PipelineConfig { partitions: 2, ..PipelineConfig::default() };
        let pipeline = Pipeline::spawn(config, tables, Arc::new(ProperNounExtractor));
        pipeline.submit("a", "Ada Lovelace wrote to Charles Babbage").await.unwrap();
        pipeline.submit("b", "Charles Babbage").await.unwrap();
        pipeline.submit("c", "nothing").await.unwrap();
        let tables = pipeline.shutdown().await.unwrap();
        store.flush().unwrap();
        (
            tables.document_count.entries(),
            tables.document_frequency.entries(),
            tables.term_occurrence.entries(),
            tables.most_important_score.entries(),
        )
    };

    let live_keys = {
        let store = StateStore::open(&paths, 2).unwrap();
        let tables = Tables::open(&store, 2).unwrap();
        assert_eq!(tables.document_count.get(DOCUMENTS_KEY), 3);
        assert_eq!(tables.document_frequency.get("Charles Babbage"), 2);
        assert_eq!(
            (
                tables.document_count.entries(),
                tables.document_frequency.entries(),
                tables.term_occurrence.entries(),
                tables.most_important_score.entries(),
            ),
            expected
        );
        let written = tables.checkpoint().unwrap();
        assert_eq!(tables.changelog.len(), written);
        written
    };

    let store = StateStore::open(&paths, 2).unwrap();
    let tables = Tables::open(&store, 2).unwrap();
    assert_eq!(tables.changelog.len(), live_keys);
    assert_eq!(tables.most_important_score.entries(), expected.3);
    assert_eq!(tables.document_frequency.entries(), expected.1);
}
