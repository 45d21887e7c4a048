//! Broker custom resource as served by the eventing API group.
//!
//! The schema is owned by the eventing project; only the fields this
//! controller reads or writes are modelled, everything else round-trips
//! through the API server untouched.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Annotation selecting which broker implementation owns a Broker.
pub const BROKER_CLASS_ANNOTATION: &str = "eventing.knative.dev/broker.class";
pub const KAFKA_BROKER_CLASS: &str = "Kafka";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "eventing.knative.dev",
    version = "v1",
    kind = "Broker",
    namespaced,
    status = "BrokerStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<KReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_sink: Option<Destination>,
}

/// Either an object reference, an absolute URI, or a reference plus a
/// relative URI resolved against the referenced object's address.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Destination {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<KReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Knative-style condition; `severity` is empty for conditions that gate Ready.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Broker {
    /// Whether this controller owns the Broker.
    pub fn is_kafka_class(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BROKER_CLASS_ANNOTATION))
            .is_some_and(|c| c == KAFKA_BROKER_CLASS)
    }

    pub fn namespace_or_default(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("default") }

    pub fn name_or_empty(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }

    pub fn uid_or_empty(&self) -> &str { self.metadata.uid.as_deref().unwrap_or_default() }

    pub fn dead_letter_sink(&self) -> Option<&Destination> {
        self.spec.delivery.as_ref().and_then(|d| d.dead_letter_sink.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_eventing_broker() {
        let raw = serde_json::json!({
            "apiVersion": "eventing.knative.dev/v1",
            "kind": "Broker",
            "metadata": {
                "name": "default",
                "namespace": "ns",
                "uid": "e7185016-5d98-4b54-84e8-3b1cd4acc6b5",
                "annotations": { "eventing.knative.dev/broker.class": "Kafka" }
            },
            "spec": {
                "config": { "apiVersion": "v1", "kind": "ConfigMap", "name": "kafka-broker-config" },
                "delivery": { "deadLetterSink": { "uri": "http://dls.ns.svc.cluster.local" } }
            }
        });
        let broker: Broker = serde_json::from_value(raw).unwrap();
        assert!(broker.is_kafka_class());
        assert_eq!(broker.spec.config.as_ref().unwrap().namespace, None);
        assert_eq!(broker.dead_letter_sink().unwrap().uri.as_deref(), Some("http://dls.ns.svc.cluster.local"));
        assert!(broker.status.is_none());
    }

    #[test]
    fn other_classes_are_ignored() {
        let mut b = Broker::new("b", BrokerSpec::default());
        assert!(!b.is_kafka_class());
        b.metadata.annotations = Some([(BROKER_CLASS_ANNOTATION.to_string(), "MTChannelBasedBroker".to_string())].into());
        assert!(!b.is_kafka_class());
    }

    #[test]
    fn condition_type_field_is_renamed() {
        let c = Condition { type_: "Ready".into(), status: "True".into(), ..Default::default() };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Ready");
        assert!(v.get("reason").is_none());
    }
}
