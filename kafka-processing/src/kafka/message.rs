use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use rdkafka::message::{BorrowedMessage, Headers, Message, OwnedHeaders};
use serde::de::DeserializeOwned;

use crate::kafka::types::Partition;

/// An owned, immutable copy of a Kafka message as delivered to processing code
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    partition: Partition,

    offset: i64,

    /// Optional message key as raw bytes
    key: Option<Vec<u8>>,

    payload: Option<Vec<u8>>,

    headers: Option<OwnedHeaders>,

    /// Broker or producer timestamp, if the message carried one
    timestamp: Option<SystemTime>,
}

impl KafkaMessage {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        headers: Option<OwnedHeaders>,
        timestamp: Option<SystemTime>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            headers,
            timestamp,
        }
    }

    /// Copy a borrowed message out of the consumer's buffer
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg.timestamp().to_millis().and_then(timestamp_from_millis);

        Self {
            partition: Partition::new(msg.topic().to_owned(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            headers: msg.headers().map(|h| h.detach()),
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Get the message key as a UTF-8 string if possible
    pub fn key_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.key.as_ref().map(|k| std::str::from_utf8(k))
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn headers(&self) -> Option<&OwnedHeaders> {
        self.headers.as_ref()
    }

    /// Value of the first header named `name`
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .as_ref()?
            .iter()
            .find(|h| h.key == name)
            .and_then(|h| h.value)
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Deserialize the payload as JSON
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .as_deref()
            .ok_or_else(|| anyhow!("No payload in message at offset {}", self.offset))?;

        serde_json::from_slice(payload).map_err(|e| {
            anyhow::Error::new(e).context(format!(
                "Failed to deserialize payload at {}@{}",
                self.partition, self.offset
            ))
        })
    }

    /// Create a simple KafkaMessage for testing purposes
    pub fn new_for_test(partition: Partition, offset: i64, payload: &str) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: Some(payload.as_bytes().to_vec()),
            headers: None,
            timestamp: Some(SystemTime::now()),
        }
    }

    /// Test message with a key, used to drive virtual partitioning
    pub fn new_keyed_for_test(partition: Partition, offset: i64, key: &str, payload: &str) -> Self {
        Self {
            key: Some(key.as_bytes().to_vec()),
            ..Self::new_for_test(partition, offset, payload)
        }
    }
}

/// Broker timestamps before the epoch or out of range are dropped
fn timestamp_from_millis(ms: i64) -> Option<SystemTime> {
    let ms = u64::try_from(ms).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Header;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        id: u32,
    }

    #[test]
    fn test_message_accessors() {
        let partition = Partition::new("test-topic".to_string(), 3);
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "header1",
                value: Some(b"value1"),
            })
            .insert(Header {
                key: "empty",
                value: None::<&[u8]>,
            });

        let message = KafkaMessage::new(
            partition.clone(),
            42,
            Some(b"user-1".to_vec()),
            Some(br#"{"id": 7}"#.to_vec()),
            Some(headers),
            None,
        );

        assert_eq!(message.partition(), &partition);
        assert_eq!(message.topic(), "test-topic");
        assert_eq!(message.partition_number(), 3);
        assert_eq!(message.offset(), 42);
        assert_eq!(message.key_as_str().unwrap().unwrap(), "user-1");
        assert_eq!(message.header("header1"), Some(&b"value1"[..]));
        assert_eq!(message.header("empty"), None);
        assert_eq!(message.header("missing"), None);
        assert_eq!(message.payload_json::<Payload>().unwrap(), Payload { id: 7 });
    }

    #[test]
    fn test_timestamp_from_millis() {
        assert_eq!(
            timestamp_from_millis(1_500),
            Some(UNIX_EPOCH + Duration::from_millis(1_500))
        );
        assert_eq!(timestamp_from_millis(0), Some(UNIX_EPOCH));
        assert_eq!(timestamp_from_millis(-1), None);
        assert_eq!(timestamp_from_millis(i64::MIN), None);
    }

    #[test]
    fn test_payload_json_errors() {
        let partition = Partition::new("test-topic".to_string(), 0);

        let garbage = KafkaMessage::new_for_test(partition.clone(), 1, "not json");
        assert!(garbage.payload_json::<Payload>().is_err());

        let empty = KafkaMessage::new(partition, 2, None, None, None, None);
        let err = empty.payload_json::<Payload>().unwrap_err();
        assert!(format!("{err:#}").contains("No payload"));
    }
}
