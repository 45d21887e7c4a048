//! Destination resolution for dead-letter sinks.

use kube::api::{Api, DynamicObject};
use kube::Client;
use thiserror::Error;
use url::Url;

use crate::crd::{Broker, Destination, KReference};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("destination has neither ref nor uri")]
    Empty,
    #[error("invalid uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("failed to get {kind} {namespace}/{name}: {reason}")]
    Lookup { kind: String, namespace: String, name: String, reason: String },
    #[error("{kind} {namespace}/{name} does not have an address")]
    NotAddressable { kind: String, namespace: String, name: String },
}

/// Turns a [`Destination`] into an absolute URI. `owner` supplies the
/// namespace for references that omit one.
#[async_trait::async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, destination: &Destination, owner: &Broker) -> Result<String, ResolveError>;
}

/// Combine a resolved base address with the destination's optional URI.
pub fn with_relative_uri(base: &str, uri: Option<&str>) -> Result<String, ResolveError> {
    let Some(rel) = uri.filter(|u| !u.is_empty()) else {
        return Ok(base.to_string());
    };
    let invalid = |reason: String| ResolveError::InvalidUri { uri: rel.to_string(), reason };
    let base = Url::parse(base).map_err(|e| ResolveError::InvalidUri { uri: base.to_string(), reason: e.to_string() })?;
    base.join(rel).map(String::from).map_err(|e| invalid(e.to_string()))
}

/// An absolute URI is used as is, after validation.
pub fn absolute_uri(uri: &str) -> Result<String, ResolveError> {
    let parsed = Url::parse(uri).map_err(|e| ResolveError::InvalidUri { uri: uri.to_string(), reason: e.to_string() })?;
    if parsed.cannot_be_a_base() || !parsed.has_host() {
        return Err(ResolveError::InvalidUri { uri: uri.to_string(), reason: "not an absolute URI".into() });
    }
    Ok(uri.to_string())
}

fn is_core_service(r: &KReference) -> bool { r.kind == "Service" && (r.api_version == "v1" || r.api_version.is_empty()) }

/// Resolver that looks referenced objects up in the cluster.
///
/// Core `Service`s resolve to their cluster DNS name; any other kind must
/// publish `status.address.url`.
pub struct KubeResolver {
    client: Client,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self { Self { client } }

    async fn address_of(&self, r: &KReference, namespace: &str) -> Result<String, ResolveError> {
        if is_core_service(r) {
            return Ok(format!("http://{}.{}.svc.cluster.local", r.name, namespace));
        }
        let lookup = |reason: String| ResolveError::Lookup {
            kind: r.kind.clone(),
            namespace: namespace.to_string(),
            name: r.name.clone(),
            reason,
        };
        let gvk = kbroker_kubehub::parse_gvk(&r.api_version, &r.kind).map_err(|e| lookup(e.to_string()))?;
        let (ar, _namespaced) = kbroker_kubehub::find_api_resource(self.client.clone(), &gvk)
            .await
            .map_err(|e| lookup(e.to_string()))?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let obj = api.get(&r.name).await.map_err(|e| lookup(e.to_string()))?;
        obj.data
            .pointer("/status/address/url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NotAddressable { kind: r.kind.clone(), namespace: namespace.to_string(), name: r.name.clone() })
    }
}

#[async_trait::async_trait]
impl DestinationResolver for KubeResolver {
    async fn resolve(&self, destination: &Destination, owner: &Broker) -> Result<String, ResolveError> {
        match (&destination.reference, destination.uri.as_deref()) {
            (Some(r), uri) => {
                let namespace = r.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(owner.namespace_or_default());
                let base = self.address_of(r, namespace).await?;
                with_relative_uri(&base, uri)
            }
            (None, Some(uri)) => absolute_uri(uri),
            (None, None) => Err(ResolveError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_uri_joins_base() {
        assert_eq!(with_relative_uri("http://sink.ns.svc.cluster.local", Some("/dead")).unwrap(), "http://sink.ns.svc.cluster.local/dead");
        assert_eq!(with_relative_uri("http://sink.ns.svc.cluster.local", None).unwrap(), "http://sink.ns.svc.cluster.local");
    }

    #[test]
    fn absolute_uri_is_validated() {
        assert_eq!(absolute_uri("http://dls.example.com").unwrap(), "http://dls.example.com");
        assert!(absolute_uri("/relative").is_err());
        assert!(absolute_uri("mailto:someone@example.com").is_err());
    }

    #[test]
    fn core_service_detection() {
        let svc = KReference { api_version: "v1".into(), kind: "Service".into(), namespace: None, name: "sink".into() };
        assert!(is_core_service(&svc));
        let ksvc = KReference { api_version: "serving.knative.dev/v1".into(), ..svc };
        assert!(!is_core_service(&ksvc));
    }
}
