//! The shared data-plane artifact: one ConfigMap per cluster holding the
//! encoded `Brokers` aggregate, guarded by optimistic concurrency.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kbroker_core::{decode, encode, Brokers, DecodeError, Format, ModelError};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use metrics::counter;
use thiserror::Error;
use tracing::debug;

/// Key of the payload inside the ConfigMap's `binaryData`.
pub const ARTIFACT_DATA_KEY: &str = "data";

/// A fetched artifact: its bytes (absent right after creation) plus the
/// concurrency token that the next update must present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub payload: Option<Vec<u8>>,
    pub version: Option<String>,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to access artifact {artifact}: {reason}")]
    Access { artifact: String, reason: String },
    #[error("artifact {artifact} was modified concurrently")]
    Conflict { artifact: String },
    #[error(transparent)]
    Encode(#[from] ModelError),
}

impl ArtifactError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ArtifactError::Conflict { .. })
    }
}

/// Storage boundary for the singleton artifact.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human readable location, used in errors and logs.
    fn describe(&self) -> String;

    /// Fetch the artifact, creating an empty one if it does not exist.
    async fn get_or_create(&self) -> Result<ArtifactHandle, ArtifactError>;

    /// Store `payload` if the artifact still has `handle.version`.
    async fn update(&self, handle: &ArtifactHandle, payload: Vec<u8>) -> Result<ArtifactHandle, ArtifactError>;
}

/// Format-aware access to an [`ArtifactStore`].
#[derive(Clone)]
pub struct Artifacts {
    store: Arc<dyn ArtifactStore>,
    format: Format,
}

impl Artifacts {
    pub fn new(store: Arc<dyn ArtifactStore>, format: Format) -> Self { Self { store, format } }

    pub fn describe(&self) -> String { self.store.describe() }

    pub async fn get_or_create(&self) -> Result<ArtifactHandle, ArtifactError> {
        self.store.get_or_create().await
    }

    /// Decode the handle's payload. A freshly created artifact reads as empty.
    pub fn read(&self, handle: &ArtifactHandle) -> Result<Brokers, DecodeError> {
        match handle.payload.as_deref() {
            None => Ok(Brokers::default()),
            Some(bytes) => decode(bytes, self.format),
        }
    }

    pub async fn write(&self, handle: &ArtifactHandle, brokers: &Brokers) -> Result<ArtifactHandle, ArtifactError> {
        let payload = encode(brokers, self.format)?;
        debug!(artifact = %self.store.describe(), bytes = payload.len(), generation = brokers.volume_generation, "writing artifact");
        let res = self.store.update(handle, payload).await;
        match &res {
            Ok(_) => counter!("artifact_writes", 1u64),
            Err(e) if e.is_conflict() => counter!("artifact_conflicts", 1u64),
            Err(_) => counter!("artifact_write_errors", 1u64),
        }
        res
    }
}

/// [`ArtifactStore`] backed by a namespaced ConfigMap.
pub struct ConfigMapArtifacts {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapArtifacts {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string(), name: name.to_string() }
    }

    /// Read-only fetch; `None` when the artifact has not been created yet.
    pub async fn fetch(&self) -> Result<Option<ArtifactHandle>, ArtifactError> {
        self.api.get_opt(&self.name).await.map(|cm| cm.map(handle_from)).map_err(|e| self.access_err(e))
    }

    fn access_err(&self, e: impl std::fmt::Display) -> ArtifactError {
        ArtifactError::Access { artifact: self.describe(), reason: e.to_string() }
    }

    async fn create_empty(&self) -> Result<ArtifactHandle, ArtifactError> {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some(self.name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            binary_data: Some(BTreeMap::from([(ARTIFACT_DATA_KEY.to_string(), ByteString(Vec::new()))])),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(created) => Ok(handle_from(created)),
            // another worker created it first
            Err(kube::Error::Api(ae)) if ae.code == 409 => match self.api.get_opt(&self.name).await {
                Ok(Some(existing)) => Ok(handle_from(existing)),
                Ok(None) => Err(self.access_err("created concurrently but not found")),
                Err(e) => Err(self.access_err(e)),
            },
            Err(e) => Err(self.access_err(e)),
        }
    }
}

fn handle_from(cm: ConfigMap) -> ArtifactHandle {
    let payload = cm
        .binary_data
        .and_then(|mut m| m.remove(ARTIFACT_DATA_KEY))
        .map(|b| b.0)
        .or_else(|| cm.data.and_then(|mut m| m.remove(ARTIFACT_DATA_KEY)).map(String::into_bytes))
        .filter(|b| !b.is_empty());
    ArtifactHandle { payload, version: cm.metadata.resource_version }
}

#[async_trait]
impl ArtifactStore for ConfigMapArtifacts {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get_or_create(&self) -> Result<ArtifactHandle, ArtifactError> {
        match self.api.get_opt(&self.name).await {
            Ok(Some(cm)) => Ok(handle_from(cm)),
            Ok(None) => self.create_empty().await,
            Err(e) => Err(self.access_err(e)),
        }
    }

    async fn update(&self, handle: &ArtifactHandle, payload: Vec<u8>) -> Result<ArtifactHandle, ArtifactError> {
        // resourceVersion in a merge patch is a precondition: the server answers 409 on mismatch
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": handle.version },
            "binaryData": { ARTIFACT_DATA_KEY: ByteString(payload) },
        });
        match self.api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(cm) => Ok(handle_from(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ArtifactError::Conflict { artifact: self.describe() }),
            Err(e) => Err(self.access_err(e)),
        }
    }
}
