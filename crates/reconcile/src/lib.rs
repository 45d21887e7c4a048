//! kbroker reconcile: turns Kafka-class Broker resources into topics and
//! entries of the shared data-plane artifact.

#![forbid(unsafe_code)]

use kbroker_core::Format;

pub mod config;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod events;
pub mod resolver;
pub mod retry;
pub mod status;

pub use config::{Config, ConfigMapSource, ConfigRef, ConfigResolver, KubeConfigMaps};
pub use crd::{Broker, BrokerSpec, BrokerStatus};
pub use engine::{Applied, Engine, ReconcileReport};
pub use error::ReconcileError;
pub use retry::RetryConfig;
pub use status::StatusConditionManager;

/// Process-level settings shared by the engine and the controller.
#[derive(Debug, Clone)]
pub struct Configs {
    pub system_namespace: String,
    pub data_plane_config_map_namespace: String,
    pub data_plane_config_map_name: String,
    pub data_plane_config_format: Format,
    pub defaults_config_map_name: String,
    pub receiver_selector: String,
    pub dispatcher_selector: String,
    pub ingress_host: String,
    pub retry: RetryConfig,
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            system_namespace: "knative-eventing".into(),
            data_plane_config_map_namespace: "knative-eventing".into(),
            data_plane_config_map_name: "kafka-broker-brokers-triggers".into(),
            data_plane_config_format: Format::Json,
            defaults_config_map_name: "kafka-broker-config".into(),
            receiver_selector: "app=kafka-broker-receiver".into(),
            dispatcher_selector: "app=kafka-broker-dispatcher".into(),
            ingress_host: "kafka-broker-receiver.knative-eventing.svc.cluster.local".into(),
            retry: RetryConfig::default(),
        }
    }
}

impl Configs {
    pub fn data_plane_config_map_as_string(&self) -> String {
        format!("{}/{}", self.data_plane_config_map_namespace, self.data_plane_config_map_name)
    }
}
