//! Configuration for consumers, producers, readers and connectors
//!
//! Config structs carry defaults, merge overrides and parse host-injected
//! string maps; validation happens at build time so steady state never
//! sees a configuration failure.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_HOST: &str = "127.0.0.1:9092";

const CONFIG_HOSTS: &str = "hosts";
const CONFIG_CLIENT_ID: &str = "client_id";
const CONFIG_GROUP_ID: &str = "group_id";
const CONFIG_TOPICS: &str = "topics";
const CONFIG_TOPIC: &str = "topic";
const CONFIG_AUTO_COMMIT_SECS: &str = "auto_commit_interval_secs";
const CONFIG_NAME: &str = "name";
const CONFIG_SYNCHRONOUS: &str = "synchronous";
const CONFIG_BACKOFF_SECS: &str = "backoff_seconds";

fn default_hosts() -> Vec<String> {
    vec![DEFAULT_HOST.to_string()]
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Configuration for a subscribing consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    pub client_id: String,
    pub group_id: String,
    /// Input topics; at least one is required
    #[serde(default)]
    pub topics: Vec<String>,
    /// Hosts to bootstrap from, as `host:port`
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// Cadence of automatic commits of tracked positions
    #[serde(default = "ConsumerConfig::default_auto_commit_secs")]
    pub auto_commit_interval_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            group_id: String::new(),
            topics: vec![],
            hosts: default_hosts(),
            auto_commit_interval_secs: Self::default_auto_commit_secs(),
        }
    }
}

impl ConsumerConfig {
    fn default_auto_commit_secs() -> u64 {
        5
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_secs(self.auto_commit_interval_secs)
    }

    /// Construct from a host-injected string map.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(hosts) = values.get(CONFIG_HOSTS) {
            config.hosts = split_csv(hosts);
        }
        if let Some(id) = values.get(CONFIG_CLIENT_ID) {
            config.client_id = id.trim().to_string();
        }
        if let Some(group) = values.get(CONFIG_GROUP_ID) {
            config.group_id = group.trim().to_string();
        }
        if let Some(topics) = values.get(CONFIG_TOPICS) {
            config.topics = split_csv(topics);
        }
        if let Some(secs) = values.get(CONFIG_AUTO_COMMIT_SECS) {
            config.auto_commit_interval_secs = secs
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid {CONFIG_AUTO_COMMIT_SECS}: {secs}")))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Merge another configuration over this one, overriding set fields.
    pub fn merge(&self, extra: &ConsumerConfig) -> ConsumerConfig {
        let mut out = self.clone();
        if !extra.client_id.is_empty() {
            out.client_id = extra.client_id.clone();
        }
        if !extra.group_id.is_empty() {
            out.group_id = extra.group_id.clone();
        }
        if !extra.topics.is_empty() {
            out.topics = extra.topics.clone();
        }
        if !extra.hosts.is_empty() {
            out.hosts = extra.hosts.clone();
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::Configuration("consumer group_id is required".into()));
        }
        if self.topics.is_empty() {
            return Err(Error::Configuration(
                "at least one input topic is required".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerConfig {
    pub client_id: String,
    /// Default output topic for requests that name none
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            topic: None,
            hosts: default_hosts(),
        }
    }
}

impl ProducerConfig {
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(hosts) = values.get(CONFIG_HOSTS) {
            config.hosts = split_csv(hosts);
        }
        if let Some(id) = values.get(CONFIG_CLIENT_ID) {
            config.client_id = id.trim().to_string();
        }
        if let Some(topic) = values.get(CONFIG_TOPIC) {
            config.topic = Some(topic.trim().to_string());
        }
        Ok(config)
    }
}

/// Configuration for a reader; the group never commits, so transient
/// group ids are fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReaderConfig {
    pub client_id: String,
    pub group_id: String,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            group_id: String::new(),
            hosts: default_hosts(),
        }
    }
}

impl ReaderConfig {
    pub(crate) fn as_consumer_config(&self, topic: &str) -> ConsumerConfig {
        ConsumerConfig {
            client_id: self.client_id.clone(),
            group_id: if self.group_id.is_empty() {
                format!("{}-reader", self.client_id)
            } else {
                self.group_id.clone()
            },
            topics: vec![topic.to_string()],
            hosts: self.hosts.clone(),
            auto_commit_interval_secs: ConsumerConfig::default_auto_commit_secs(),
        }
    }
}

/// Options of a periodic source connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConnectorOptions {
    /// Connector name; defaults to the data source's type name
    #[serde(default)]
    pub name: String,
    /// Await every delivery inline instead of batch-flushing
    #[serde(default)]
    pub synchronous: bool,
    /// Seconds between polls, also honored after a failed tick
    #[serde(default = "SourceConnectorOptions::default_backoff_secs")]
    pub backoff_seconds: u64,
}

impl Default for SourceConnectorOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            synchronous: false,
            backoff_seconds: Self::default_backoff_secs(),
        }
    }
}

impl SourceConnectorOptions {
    fn default_backoff_secs() -> u64 {
        30
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(name) = values.get(CONFIG_NAME) {
            options.name = name.trim().to_string();
        }
        if let Some(synchronous) = values.get(CONFIG_SYNCHRONOUS) {
            options.synchronous = synchronous
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid {CONFIG_SYNCHRONOUS}: {synchronous}")))?;
        }
        if let Some(secs) = values.get(CONFIG_BACKOFF_SECS) {
            options.backoff_seconds = secs
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid {CONFIG_BACKOFF_SECS}: {secs}")))?;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consumer_from_map_parses_and_validates() {
        let values = HashMap::from([
            ("hosts".to_string(), "a:9092, b:9092".to_string()),
            ("group_id".to_string(), "readers".to_string()),
            ("topics".to_string(), "orders,audit".to_string()),
        ]);
        let config = ConsumerConfig::from_map(&values).unwrap();
        assert_eq!(config.hosts, vec!["a:9092", "b:9092"]);
        assert_eq!(config.topics, vec!["orders", "audit"]);

        let missing = ConsumerConfig::from_map(&HashMap::new());
        assert!(matches!(missing, Err(Error::Configuration(_))));
    }

    #[test]
    fn consumer_merge_overrides_set_fields_only() {
        let base = ConsumerConfig {
            client_id: "app".into(),
            group_id: "g1".into(),
            topics: vec!["orders".into()],
            ..Default::default()
        };
        let extra = ConsumerConfig {
            group_id: "g2".into(),
            ..Default::default()
        };
        let merged = base.merge(&extra);
        assert_eq!(merged.client_id, "app");
        assert_eq!(merged.group_id, "g2");
        assert_eq!(merged.topics, vec!["orders"]);
    }

    #[test]
    fn connector_options_defaults() {
        let options = SourceConnectorOptions::default();
        assert!(!options.synchronous);
        assert_eq!(options.backoff(), Duration::from_secs(30));
    }
}
