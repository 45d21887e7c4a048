//! kbroker kubehub – kube client, discovery, ConfigMap watchers and the
//! shared data-plane artifact.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::Api,
    core::{ApiResource, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tracing::{debug, info, warn};

pub mod artifact;

pub use artifact::{ArtifactError, ArtifactHandle, ArtifactStore, Artifacts, ConfigMapArtifacts};

/// Kube client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Split an `apiVersion` (`v1` or `group/v1`) and kind into a GVK.
pub fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version] if !version.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid apiVersion: {} (expect v1 or group/v1)", api_version)),
    }
}

/// Resolve a GVK to its served resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let (ar, caps) = discovery::pinned_kind(&client, gvk)
        .await
        .map_err(|e| anyhow!("GVK not served: {}/{}/{}: {}", gvk.group, gvk.version, gvk.kind, e))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

/// List+watch a single ConfigMap and hand every observed version to `on_update`.
///
/// Deletion keeps whatever the callback last applied. Returns when the watch
/// stream ends; the caller decides whether to restart.
pub async fn watch_configmap<F>(client: Client, namespace: &str, name: &str, mut on_update: F) -> Result<()>
where
    F: FnMut(&ConfigMap) + Send,
{
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(ns = %namespace, name = %name, "configmap watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(cm) => on_update(&cm),
            Event::Deleted(_) => warn!(ns = %namespace, name = %name, "watched configmap deleted; keeping last values"),
            Event::Restarted(list) => {
                debug!(count = list.len(), "configmap watch restart");
                for cm in list.iter() {
                    on_update(cm);
                }
            }
        }
    }
    warn!(ns = %namespace, name = %name, "configmap watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gvk_core_and_grouped() {
        let core = parse_gvk("v1", "Service").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Service"));
        let svc = parse_gvk("serving.knative.dev/v1", "Service").unwrap();
        assert_eq!(svc.group, "serving.knative.dev");
        assert_eq!(svc.version, "v1");
        assert!(parse_gvk("a/b/c", "X").is_err());
        assert!(parse_gvk("", "X").is_err());
    }
}
