//! In-process partitioned channels between the stages.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::records::Record;

/// A keyed message as it travels through a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub key: String,
    pub payload: Vec<u8>,
}

/// Stable key -> partition routing shared by channels and table shards.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Sending half of a named, partitioned channel. Cloning is cheap; the channel
/// closes once every clone is dropped.
#[derive(Clone)]
pub struct Topic {
    name: Arc<str>,
    partitions: Arc<[mpsc::Sender<Envelope>]>,
}

impl Topic {
    /// Create the channel with `partitions` bounded queues of depth `capacity`.
    /// The receivers are returned in partition order.
    pub fn new(name: &str, partitions: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<Envelope>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..partitions.max(1)).map(|_| mpsc::channel(capacity.max(1))).unzip();
        (Self { name: Arc::from(name), partitions: senders.into() }, receivers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Enqueue raw bytes; waits while the target partition is full.
    pub async fn send_raw(&self, key: &str, payload: Vec<u8>) -> Result<(), PipelineError> {
        let partition = partition_for(key, self.partitions.len());
        self.partitions[partition]
            .send(Envelope { key: key.to_string(), payload })
            .await
            .map_err(|_| PipelineError::ChannelClosed(self.name.to_string()))
    }

    pub async fn send<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(value)?;
        self.send_raw(key, payload).await
    }
}

/// Decode and validate a record; any failure is a MalformedRecord.
pub fn decode<T: DeserializeOwned + Record>(topic: &str, envelope: &Envelope) -> Result<T, PipelineError> {
    let record: T =
        serde_json::from_slice(&envelope.payload).map_err(|e| PipelineError::malformed(topic, e.to_string()))?;
    record.validate().map_err(|message| PipelineError::malformed(topic, message))?;
    Ok(record)
}

/// Typed receiving half of one partition.
pub struct Subscription<T> {
    topic: String,
    rx: mpsc::Receiver<Envelope>,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Record> Subscription<T> {
    pub fn new(topic: &str, rx: mpsc::Receiver<Envelope>) -> Self {
        Self { topic: topic.to_string(), rx, _record: PhantomData }
    }

    /// Next decoded record; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Result<T, PipelineError>> {
        let envelope = self.rx.recv().await?;
        Some(decode(&self.topic, &envelope))
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Result<T, PipelineError>> {
        let envelope = self.rx.try_recv().ok()?;
        Some(decode(&self.topic, &envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ScoreRecord;

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["d1", "s3://data/a.txt", "", "John Doe"] {
            let p = partition_for(key, 7);
            assert!(p < 7);
            assert_eq!(p, partition_for(key, 7));
        }
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let (topic, mut receivers) = Topic::new("TFIDFScore", 4, 8);
        topic.send_raw("d1", b"a".to_vec()).await.unwrap();
        topic.send_raw("d1", b"b".to_vec()).await.unwrap();
        let rx = &mut receivers[partition_for("d1", 4)];
        assert_eq!(rx.recv().await.unwrap().payload, b"a");
        assert_eq!(rx.recv().await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (topic, receivers) = Topic::new("TFIDFScore", 1, 1);
        drop(receivers);
        let err = topic.send_raw("d1", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChannelClosed(name) if name == "TFIDFScore"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let garbage = Envelope { key: "d1".into(), payload: b"{\"document\":".to_vec() };
        assert!(matches!(decode::<ScoreRecord>("TFIDFScore", &garbage), Err(PipelineError::MalformedRecord { .. })));

        let infinite = Envelope { key: "d1".into(), payload: br#"{"document":"d1","term":"x","tfidf":1e999}"#.to_vec() };
        assert!(decode::<ScoreRecord>("TFIDFScore", &infinite).is_err());
    }
}
