//! kbroker ops: imperative cluster operations the reconciler performs
//! besides writing the artifact: pod annotation pushes and topic admin.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kbroker_core::VOLUME_GENERATION_ANNOTATION;
use kube::{api::{Api, ListParams, Patch, PatchParams}, Client};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

pub mod topic;

pub use topic::{TopicAdmin, TopicAdminError, TopicProvisionError, TopicProvisioner};
#[cfg(feature = "kafka")]
pub use topic::RsKafkaAdmin;

/// Minimal view of a pod: enough to address it and skip no-op patches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error)]
pub enum PodOpsError {
    #[error("failed to list pods with selector {selector}: {reason}")]
    List { selector: String, reason: String },
    #[error("failed to patch pod {pod}: {reason}")]
    Patch { pod: String, reason: String },
}

/// Pod boundary: list by label selector, patch one annotation.
#[async_trait::async_trait]
pub trait PodOps: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodRef>, PodOpsError>;
    async fn patch_annotation(&self, namespace: &str, pod: &str, key: &str, value: &str) -> Result<(), PodOpsError>;
}

/// Default implementation using kube-rs client APIs.
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl PodOps for KubeOps {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodRef>, PodOpsError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| PodOpsError::List { selector: selector.to_string(), reason: e.to_string() })?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| {
                let name = p.metadata.name?;
                Some(PodRef { name, annotations: p.metadata.annotations.unwrap_or_default() })
            })
            .collect())
    }

    async fn patch_annotation(&self, namespace: &str, pod: &str, key: &str, value: &str) -> Result<(), PodOpsError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": { key: value } } });
        api.patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| PodOpsError::Patch { pod: pod.to_string(), reason: e.to_string() })?;
        Ok(())
    }
}

/// Data-plane pod classes; receivers must be notified, dispatchers should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodClass {
    Receiver,
    Dispatcher,
}

impl fmt::Display for PodClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodClass::Receiver => f.write_str("receiver"),
            PodClass::Dispatcher => f.write_str("dispatcher"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to update {class} pods annotation: {}", join(.failures))]
pub struct NotifyError {
    pub class: PodClass,
    pub failures: Vec<PodOpsError>,
}

fn join(failures: &[PodOpsError]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

/// Pushes the artifact generation to data-plane pods through an annotation,
/// which makes the kubelet refresh the mounted artifact right away.
pub struct PodNotifier {
    ops: Arc<dyn PodOps>,
    namespace: String,
    receiver_selector: String,
    dispatcher_selector: String,
}

impl PodNotifier {
    pub fn new(ops: Arc<dyn PodOps>, namespace: &str, receiver_selector: &str, dispatcher_selector: &str) -> Self {
        Self {
            ops,
            namespace: namespace.to_string(),
            receiver_selector: receiver_selector.to_string(),
            dispatcher_selector: dispatcher_selector.to_string(),
        }
    }

    /// Receiver pods. Any failure must fail the reconcile.
    pub async fn notify_hard(&self, generation: u64) -> Result<usize, NotifyError> {
        self.notify(PodClass::Receiver, &self.receiver_selector, generation).await
    }

    /// Dispatcher pods. They refresh on their own, the push only cuts latency.
    pub async fn notify_soft(&self, generation: u64) -> Result<usize, NotifyError> {
        let res = self.notify(PodClass::Dispatcher, &self.dispatcher_selector, generation).await;
        if let Err(e) = &res {
            warn!(error = %e, generation, "dispatcher pods will pick up the artifact on their next refresh");
        }
        res
    }

    /// Patch every pod of `class` whose annotation differs; returns how many were patched.
    async fn notify(&self, class: PodClass, selector: &str, generation: u64) -> Result<usize, NotifyError> {
        let value = generation.to_string();
        let pods = self
            .ops
            .list_pods(&self.namespace, selector)
            .await
            .map_err(|e| NotifyError { class, failures: vec![e] })?;

        let stale: Vec<&PodRef> = pods
            .iter()
            .filter(|p| p.annotations.get(VOLUME_GENERATION_ANNOTATION) != Some(&value))
            .collect();
        debug!(%class, total = pods.len(), stale = stale.len(), generation, "updating pods annotation");

        let results = join_all(
            stale.iter().map(|p| self.ops.patch_annotation(&self.namespace, &p.name, VOLUME_GENERATION_ANNOTATION, &value)),
        )
        .await;
        let failures: Vec<PodOpsError> = results.into_iter().filter_map(Result::err).collect();
        if !failures.is_empty() {
            counter!("pod_notify_failures", failures.len() as u64, "class" => class.to_string());
            return Err(NotifyError { class, failures });
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePods {
        pods: BTreeMap<String, Vec<PodRef>>,
        fail_patch: Vec<String>,
        patched: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl PodOps for FakePods {
        async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<PodRef>, PodOpsError> {
            Ok(self.pods.get(selector).cloned().unwrap_or_default())
        }
        async fn patch_annotation(&self, _namespace: &str, pod: &str, _key: &str, value: &str) -> Result<(), PodOpsError> {
            if self.fail_patch.iter().any(|p| p == pod) {
                return Err(PodOpsError::Patch { pod: pod.into(), reason: "forbidden".into() });
            }
            self.patched.lock().unwrap().push((pod.to_string(), value.to_string()));
            Ok(())
        }
    }

    fn pod(name: &str, generation: Option<&str>) -> PodRef {
        let mut annotations = BTreeMap::new();
        if let Some(g) = generation {
            annotations.insert(VOLUME_GENERATION_ANNOTATION.to_string(), g.to_string());
        }
        PodRef { name: name.into(), annotations }
    }

    fn fake() -> FakePods {
        FakePods {
            pods: BTreeMap::from([
                ("app=receiver".to_string(), vec![pod("r1", Some("1")), pod("r2", Some("2"))]),
                ("app=dispatcher".to_string(), vec![pod("d1", None)]),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn patches_only_stale_pods() {
        let ops = Arc::new(fake());
        let notifier = PodNotifier::new(ops.clone(), "knative-eventing", "app=receiver", "app=dispatcher");
        assert_eq!(notifier.notify_hard(2).await.unwrap(), 1);
        assert_eq!(notifier.notify_soft(2).await.unwrap(), 1);
        let patched = ops.patched.lock().unwrap().clone();
        assert_eq!(patched, vec![("r1".to_string(), "2".to_string()), ("d1".to_string(), "2".to_string())]);
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let mut f = fake();
        f.fail_patch = vec!["r1".into(), "r2".into()];
        let notifier = PodNotifier::new(Arc::new(f), "knative-eventing", "app=receiver", "app=dispatcher");
        let err = notifier.notify_hard(3).await.unwrap_err();
        assert_eq!(err.class, PodClass::Receiver);
        assert_eq!(err.failures.len(), 2);
        assert!(err.to_string().contains("receiver"));
        assert!(err.to_string().contains("r2"));
    }
}
