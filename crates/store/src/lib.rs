//! kbroker store: process-wide cluster defaults and an in-RAM artifact store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kbroker_core::{split_bootstrap_servers, TopicDetail};
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod memory;

pub use memory::MemoryArtifacts;

pub const DEFAULT_TOPIC_PARTITIONS_KEY: &str = "default.topic.partitions";
pub const DEFAULT_TOPIC_REPLICATION_FACTOR_KEY: &str = "default.topic.replication.factor";
pub const BOOTSTRAP_SERVERS_KEY: &str = "bootstrap.servers";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefaultsError {
    #[error("no bootstrap.servers provided")]
    NoDefaultBootstrapServers,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigParseError {
    #[error("missing key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: String },
}

pub fn parse_partitions(raw: &str) -> Result<i32, ConfigParseError> {
    parse_positive::<i32>(DEFAULT_TOPIC_PARTITIONS_KEY, raw)
}

pub fn parse_replication_factor(raw: &str) -> Result<i16, ConfigParseError> {
    parse_positive::<i16>(DEFAULT_TOPIC_REPLICATION_FACTOR_KEY, raw)
}

pub fn parse_bootstrap_servers(raw: &str) -> Result<Vec<String>, ConfigParseError> {
    let servers = split_bootstrap_servers(raw);
    if servers.is_empty() {
        return Err(ConfigParseError::Invalid { key: BOOTSTRAP_SERVERS_KEY, value: raw.to_string(), reason: "empty".into() });
    }
    Ok(servers)
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigParseError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let v: T = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigParseError::Invalid { key, value: raw.to_string(), reason: e.to_string() })?;
    if v <= T::default() {
        return Err(ConfigParseError::Invalid { key, value: raw.to_string(), reason: "must be positive".into() });
    }
    Ok(v)
}

/// Strict parse of a broker-config ConfigMap: every key must be present and valid.
pub fn parse_topic_config(data: &BTreeMap<String, String>) -> Result<(TopicDetail, Vec<String>), ConfigParseError> {
    let get = |key: &'static str| data.get(key).ok_or(ConfigParseError::Missing(key));
    let detail = TopicDetail {
        num_partitions: parse_partitions(get(DEFAULT_TOPIC_PARTITIONS_KEY)?)?,
        replication_factor: parse_replication_factor(get(DEFAULT_TOPIC_REPLICATION_FACTOR_KEY)?)?,
    };
    let servers = parse_bootstrap_servers(get(BOOTSTRAP_SERVERS_KEY)?)?;
    Ok((detail, servers))
}

/// Cluster-wide transport defaults shared by every reconcile worker.
///
/// The two values live in independent cells: the watch callback swaps a
/// fresh value in, readers take a snapshot and never block each other.
pub struct DefaultsCache {
    topic_detail: ArcSwap<TopicDetail>,
    bootstrap_servers: ArcSwap<Vec<String>>,
    revision: watch::Sender<u64>,
}

impl Default for DefaultsCache {
    fn default() -> Self { Self::new(TopicDetail::default()) }
}

impl DefaultsCache {
    pub fn new(topic_detail: TopicDetail) -> Self {
        let (revision, _) = watch::channel(0u64);
        Self {
            topic_detail: ArcSwap::from_pointee(topic_detail),
            bootstrap_servers: ArcSwap::from_pointee(Vec::new()),
            revision,
        }
    }

    pub fn shared(topic_detail: TopicDetail) -> Arc<Self> { Arc::new(Self::new(topic_detail)) }

    pub fn topic_detail(&self) -> TopicDetail { **self.topic_detail.load() }

    pub fn set_topic_detail(&self, detail: TopicDetail) {
        self.topic_detail.store(Arc::new(detail));
        self.bump();
    }

    /// Current default bootstrap servers; fails while none were configured.
    pub fn bootstrap_servers(&self) -> Result<Vec<String>, DefaultsError> {
        let servers = self.bootstrap_servers.load_full();
        if servers.is_empty() {
            return Err(DefaultsError::NoDefaultBootstrapServers);
        }
        Ok(servers.as_ref().clone())
    }

    /// Replace the bootstrap list from a comma separated string. Blank input is ignored.
    pub fn set_bootstrap_servers(&self, servers: &str) {
        let addrs = split_bootstrap_servers(servers);
        if addrs.is_empty() {
            return;
        }
        self.bootstrap_servers.store(Arc::new(addrs));
        self.bump();
    }

    /// Revision counter, bumped on every accepted change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.revision.subscribe() }

    pub fn revision(&self) -> u64 { *self.revision.borrow() }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Watch callback for the system defaults ConfigMap.
    ///
    /// Keys are applied one by one; a malformed or missing key leaves the
    /// previous value of that key in place. Returns how many keys were applied.
    pub fn apply_configmap(&self, data: &BTreeMap<String, String>) -> usize {
        let mut applied = 0;
        let mut detail = self.topic_detail();
        let mut detail_changed = false;

        match data.get(DEFAULT_TOPIC_PARTITIONS_KEY).map(|v| parse_partitions(v)) {
            Some(Ok(p)) => { detail.num_partitions = p; detail_changed = true; applied += 1; }
            Some(Err(e)) => { warn!(error = %e, "ignoring default partitions"); counter!("defaults_ignored_keys", 1u64); }
            None => {}
        }
        match data.get(DEFAULT_TOPIC_REPLICATION_FACTOR_KEY).map(|v| parse_replication_factor(v)) {
            Some(Ok(r)) => { detail.replication_factor = r; detail_changed = true; applied += 1; }
            Some(Err(e)) => { warn!(error = %e, "ignoring default replication factor"); counter!("defaults_ignored_keys", 1u64); }
            None => {}
        }
        if detail_changed {
            self.set_topic_detail(detail);
        }
        match data.get(BOOTSTRAP_SERVERS_KEY).map(|v| parse_bootstrap_servers(v)) {
            Some(Ok(servers)) => {
                self.bootstrap_servers.store(Arc::new(servers));
                self.bump();
                applied += 1;
            }
            Some(Err(e)) => { warn!(error = %e, "ignoring default bootstrap servers"); counter!("defaults_ignored_keys", 1u64); }
            None => {}
        }

        if applied > 0 {
            info!(
                partitions = detail.num_partitions,
                replication_factor = detail.replication_factor,
                bootstrap_servers = ?self.bootstrap_servers.load_full(),
                "cluster defaults updated"
            );
        } else {
            debug!("defaults configmap carried no usable keys");
        }
        applied
    }
}
