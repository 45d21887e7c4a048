//! kbroker core types: the data-plane contract shared by the control plane,
//! the receiver pods and the dispatcher pods.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

pub mod codec;

pub use codec::{decode, encode, DecodeError, Format, ModelError};

/// Prefix of every physical topic backing a Broker.
pub const TOPIC_PREFIX: &str = "knative-broker-";

/// Pod annotation holding the decimal `volumeGeneration` a pod should refresh to.
pub const VOLUME_GENERATION_ANNOTATION: &str = "volumeGeneration";

/// Routing record owned by the trigger reconciler. Opaque to the broker path.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Trigger {
    /// Filter attributes, interpreted by the dispatcher only.
    #[prost(btree_map = "string, string", tag = "1")]
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub destination: String,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub id: String,
}

/// One Broker entry of the shared artifact.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Broker {
    /// UID of the owning Broker resource.
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub id: String,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub topic: String,
    #[prost(string, tag = "3")]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dead_letter_sink: String,
    #[prost(message, repeated, tag = "4")]
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[prost(string, tag = "5")]
    #[serde(default)]
    pub path: String,
    /// Comma separated bootstrap servers.
    #[prost(string, tag = "6")]
    #[serde(default)]
    pub bootstrap_servers: String,
}

/// The shared aggregate, versioned by `volume_generation`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Brokers {
    #[prost(message, repeated, tag = "1")]
    #[serde(default)]
    pub brokers: Vec<Broker>,
    #[prost(uint64, tag = "2")]
    #[serde(default, deserialize_with = "u64_number_or_string")]
    pub volume_generation: u64,
}

impl Brokers {
    /// Index of the entry owned by `id`, `None` if it is not there yet.
    pub fn find(&self, id: &str) -> Option<usize> {
        self.brokers.iter().position(|b| b.id == id)
    }

    /// Replace the entry at `index` (keeping its triggers) or append a new one.
    ///
    /// Triggers belong to the trigger reconciler, so whatever the artifact
    /// already holds for this broker wins over `entry.triggers`.
    pub fn upsert(&mut self, index: Option<usize>, mut entry: Broker) {
        match index {
            Some(i) => {
                entry.triggers = std::mem::take(&mut self.brokers[i].triggers);
                self.brokers[i] = entry;
            }
            None => {
                entry.triggers.clear();
                self.brokers.push(entry);
            }
        }
    }

    /// Remove the entry at `index` by swapping the last entry into its slot.
    /// Does not preserve order. `volume_generation` is left untouched.
    pub fn swap_remove(&mut self, index: usize) -> Broker {
        if self.brokers.len() == 1 {
            let removed = self.brokers.pop().unwrap_or_default();
            self.brokers = Vec::new();
            return removed;
        }
        self.brokers.swap_remove(index)
    }

    /// Advance the generation and return the new value.
    pub fn bump_generation(&mut self) -> u64 {
        self.volume_generation = increment_generation(self.volume_generation);
        self.volume_generation
    }
}

/// Sizing of a physical topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDetail {
    pub num_partitions: i32,
    pub replication_factor: i16,
}

impl Default for TopicDetail {
    fn default() -> Self {
        Self { num_partitions: 10, replication_factor: 1 }
    }
}

/// `(generation + 1) mod (u64::MAX - 1)`: wraps to 0 before reaching `u64::MAX - 1`.
pub fn increment_generation(generation: u64) -> u64 {
    const MODULUS: u64 = u64::MAX - 1;
    // generation < MODULUS for every value this function produced, so +1 cannot overflow.
    (generation % MODULUS + 1) % MODULUS
}

/// Physical topic for a Broker: `knative-broker-<namespace>-<name>`.
pub fn topic_name(namespace: &str, name: &str) -> String {
    format!("{}{}-{}", TOPIC_PREFIX, namespace, name)
}

/// Ingress routing prefix for a Broker.
pub fn path(namespace: &str, name: &str) -> String {
    format!("/{}/{}", namespace, name)
}

/// Split a comma separated bootstrap list, dropping blanks.
pub fn split_bootstrap_servers(servers: &str) -> Vec<String> {
    servers.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

// proto3 JSON renders uint64 as a string; older writers used a plain number.
fn u64_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw { Num(u64), Str(String) }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> Broker {
        Broker { id: id.into(), topic: topic_name("ns", id), path: path("ns", id), ..Default::default() }
    }

    fn trigger(id: &str) -> Trigger {
        Trigger {
            id: id.into(),
            destination: "http://example.com".into(),
            attributes: BTreeMap::from([("source".to_string(), "source1".to_string())]),
        }
    }

    #[test]
    fn generation_wraps_below_max() {
        assert_eq!(increment_generation(0), 1);
        assert_eq!(increment_generation(u64::MAX - 3), u64::MAX - 2);
        assert_eq!(increment_generation(u64::MAX - 2), 0);
        // never lands on the two reserved values
        let mut g = u64::MAX - 5;
        for _ in 0..10 {
            g = increment_generation(g);
            assert!(g < u64::MAX - 1);
        }
    }

    #[test]
    fn naming_conventions() {
        assert_eq!(topic_name("ns", "B1"), "knative-broker-ns-B1");
        assert_eq!(path("broker-namespace", "broker-name"), "/broker-namespace/broker-name");
        assert_eq!(split_bootstrap_servers("kafka-1:9092, kafka-2:9093,"), vec!["kafka-1:9092", "kafka-2:9093"]);
    }

    #[test]
    fn upsert_keeps_existing_triggers() {
        let mut agg = Brokers::default();
        let mut first = entry("b1");
        first.triggers = vec![trigger("t1"), trigger("t2")];
        agg.brokers.push(first);

        let mut update = entry("b1");
        update.bootstrap_servers = "k2:9092".into();
        update.triggers = vec![trigger("bogus")];
        let idx = agg.find("b1");
        agg.upsert(idx, update);

        assert_eq!(agg.brokers.len(), 1);
        assert_eq!(agg.brokers[0].bootstrap_servers, "k2:9092");
        assert_eq!(agg.brokers[0].triggers, vec![trigger("t1"), trigger("t2")]);
    }

    #[test]
    fn upsert_appends_with_empty_triggers() {
        let mut agg = Brokers::default();
        let mut e = entry("b2");
        e.triggers.push(trigger("t"));
        agg.upsert(None, e);
        assert_eq!(agg.find("b2"), Some(0));
        assert!(agg.brokers[0].triggers.is_empty());
    }

    #[test]
    fn swap_remove_sole_entry_keeps_generation() {
        let mut agg = Brokers { brokers: vec![entry("b1")], volume_generation: 7 };
        let removed = agg.swap_remove(0);
        assert_eq!(removed.id, "b1");
        assert!(agg.brokers.is_empty());
        assert_eq!(agg.volume_generation, 7);
    }

    #[test]
    fn swap_remove_preserves_others() {
        let mut agg = Brokers { brokers: vec![entry("a"), entry("b"), entry("c"), entry("d")], volume_generation: 3 };
        agg.swap_remove(1);
        let mut ids: Vec<_> = agg.brokers.iter().map(|b| b.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert_eq!(agg.brokers.iter().find(|b| b.id == "d"), Some(&entry("d")));
        assert_eq!(agg.volume_generation, 3);
    }
}
