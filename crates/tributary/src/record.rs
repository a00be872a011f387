//! The immutable record model shared by consumers, producers and connectors

use std::fmt;

use bytes::Bytes;

/// Header carrying an explicit event time (unix ms, decimal string) on a
/// produced record; read back as the event-time override on consumption.
pub const EVENT_TIME_HEADER: &str = "tributary-event-time";
/// Header naming the source connector that produced a record; used to
/// rehydrate checkpoints from destination-topic tails.
pub const SOURCE_HEADER: &str = "tributary-source";
/// Header carrying the producing request's correlation id.
pub const REQUEST_ID_HEADER: &str = "tributary-request-id";

/// Timestamp value meaning "not known", matching the broker convention.
pub const NO_TIMESTAMP: i64 = -1;

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// The broker's notion of location: a topic, partition, offset and the
/// log-append timestamp (unix ms) of the record at that offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
}

impl Position {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: NO_TIMESTAMP,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Identity of a durably written record, derived from its position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl From<&Position> for RecordId {
    fn from(position: &Position) -> Self {
        Self {
            topic: position.topic.clone(),
            partition: position.partition,
            offset: position.offset,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.topic, self.partition, self.offset)
    }
}

/// An ordered list of header name/value pairs.
///
/// Insertion order and duplicates are preserved; lookup by name returns the
/// most recently appended value, so appending acts as an override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, Bytes)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.0.push((name.into(), value.into()));
    }

    /// Builder-style [`append`](Self::append).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.append(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_ref())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Bytes)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, Bytes);
    type IntoIter = std::vec::IntoIter<(String, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An immutable consumer-side record.
///
/// The event time is the record's log-append time unless the producer set
/// an explicit [`EVENT_TIME_HEADER`] override.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: RecordId,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Headers,
    pub position: Position,
    pub event_time: i64,
}

impl Record {
    pub(crate) fn assemble(
        position: Position,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Headers,
    ) -> Self {
        let event_time = headers
            .get_str(EVENT_TIME_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(position.timestamp);
        Self {
            id: RecordId::from(&position),
            key,
            value,
            headers,
            position,
            event_time,
        }
    }

    pub fn topic(&self) -> &str {
        &self.position.topic
    }

    pub fn partition(&self) -> i32 {
        self.position.partition
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }

    /// Convenience accessor for JSON payloads.
    pub fn value_json(&self) -> crate::Result<serde_json::Value> {
        let data = self
            .value
            .as_deref()
            .ok_or_else(|| crate::Error::Codec("record has no value".into()))?;
        serde_json::from_slice(data).map_err(|e| crate::Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn position() -> Position {
        Position::new("meters", 2, 41).with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn event_time_defaults_to_log_append_time() {
        let record = Record::assemble(position(), None, None, Headers::new());
        assert_eq!(record.event_time, 1_700_000_000_000);
        assert_eq!(record.id.to_string(), "meters:2@41");
    }

    #[test]
    fn event_time_header_overrides() {
        let headers = Headers::new().with(EVENT_TIME_HEADER, "12345");
        let record = Record::assemble(position(), None, None, headers);
        assert_eq!(record.event_time, 12_345);
    }

    #[test]
    fn malformed_event_time_header_is_ignored() {
        let headers = Headers::new().with(EVENT_TIME_HEADER, "not-a-number");
        let record = Record::assemble(position(), None, None, headers);
        assert_eq!(record.event_time, 1_700_000_000_000);
    }

    #[test]
    fn headers_last_value_wins_and_order_is_kept() {
        let headers = Headers::new()
            .with("a", "1")
            .with("b", "2")
            .with("a", "3");
        assert_eq!(headers.get_str("a"), Some("3"));
        let names: Vec<_> = headers.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }
}
