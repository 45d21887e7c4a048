//! Per-Broker transport settings: an explicit ConfigMap reference on the
//! Broker, or the process-wide defaults.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kbroker_core::TopicDetail;
use kbroker_store::{parse_topic_config, ConfigParseError, DefaultsCache, DefaultsError};
use kube::{Api, Client};
use thiserror::Error;
use tracing::debug;

use crate::crd::{Broker, KReference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub topic_detail: TopicDetail,
    pub bootstrap_servers: Vec<String>,
}

impl Config {
    /// Connection string stored in the artifact entry.
    pub fn bootstrap_servers_string(&self) -> String { self.bootstrap_servers.join(",") }
}

/// Kind of the explicit config reference. Only ConfigMaps are understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRef {
    ConfigMap { namespace: String, name: String },
    Unsupported(String),
}

impl ConfigRef {
    /// Classify `reference`; a missing namespace means the Broker's own.
    pub fn from_reference(reference: &KReference, broker_namespace: &str) -> Self {
        if !reference.kind.eq_ignore_ascii_case("configmap") {
            return ConfigRef::Unsupported(reference.kind.clone());
        }
        let namespace = match reference.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => broker_namespace.to_string(),
        };
        ConfigRef::ConfigMap { namespace, name: reference.name.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("supported config Kind: ConfigMap - got {0}")]
    UnsupportedKind(String),
    #[error("failed to get configmap {namespace}/{name}: {reason}")]
    Get { namespace: String, name: String, reason: String },
    #[error("invalid configmap {namespace}/{name}: {source}")]
    Invalid { namespace: String, name: String, source: ConfigParseError },
    #[error(transparent)]
    Defaults(#[from] DefaultsError),
}

/// Read access to ConfigMap data.
#[async_trait::async_trait]
pub trait ConfigMapSource: Send + Sync {
    /// `Ok(None)` when the ConfigMap does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>, String>;
}

pub struct KubeConfigMaps {
    client: Client,
}

impl KubeConfigMaps {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ConfigMapSource for KubeConfigMaps {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>, String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(cm) => Ok(cm.map(|c| c.data.unwrap_or_default())),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ConfigResolver {
    defaults: Arc<DefaultsCache>,
    config_maps: Arc<dyn ConfigMapSource>,
}

impl ConfigResolver {
    pub fn new(defaults: Arc<DefaultsCache>, config_maps: Arc<dyn ConfigMapSource>) -> Self {
        Self { defaults, config_maps }
    }

    pub async fn resolve(&self, broker: &Broker) -> Result<Config, ConfigError> {
        let Some(reference) = broker.spec.config.as_ref() else {
            return self.defaults();
        };
        match ConfigRef::from_reference(reference, broker.namespace_or_default()) {
            ConfigRef::Unsupported(kind) => Err(ConfigError::UnsupportedKind(kind)),
            ConfigRef::ConfigMap { namespace, name } => {
                let data = self
                    .config_maps
                    .get(&namespace, &name)
                    .await
                    .map_err(|reason| ConfigError::Get { namespace: namespace.clone(), name: name.clone(), reason })?
                    .ok_or_else(|| ConfigError::Get { namespace: namespace.clone(), name: name.clone(), reason: "not found".into() })?;
                let (topic_detail, bootstrap_servers) =
                    parse_topic_config(&data).map_err(|source| ConfigError::Invalid { namespace, name, source })?;
                debug!(partitions = topic_detail.num_partitions, servers = ?bootstrap_servers, "config resolved from configmap");
                Ok(Config { topic_detail, bootstrap_servers })
            }
        }
    }

    fn defaults(&self) -> Result<Config, ConfigError> {
        Ok(Config { bootstrap_servers: self.defaults.bootstrap_servers()?, topic_detail: self.defaults.topic_detail() })
    }
}
