//! Topic administration. The provisioner is idempotent on top of a raw admin
//! client: "already exists" on create and "unknown topic" on delete are success.

use std::sync::Arc;

use kbroker_core::TopicDetail;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicAdminError {
    #[error("topic already exists")]
    AlreadyExists,
    #[error("unknown topic")]
    UnknownTopic,
    #[error("{0}")]
    Other(String),
}

/// Raw admin operations against the cluster reachable through `servers`.
#[async_trait::async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, name: &str, detail: &TopicDetail, servers: &[String]) -> Result<(), TopicAdminError>;
    async fn delete_topic(&self, name: &str, servers: &[String]) -> Result<(), TopicAdminError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to {op} topic {topic}: {reason}")]
pub struct TopicProvisionError {
    pub op: &'static str,
    pub topic: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<dyn TopicAdmin>,
}

impl TopicProvisioner {
    pub fn new(admin: Arc<dyn TopicAdmin>) -> Self { Self { admin } }

    /// Ensure `name` exists; returns the topic name.
    pub async fn create(&self, name: &str, detail: &TopicDetail, servers: &[String]) -> Result<String, TopicProvisionError> {
        match self.admin.create_topic(name, detail, servers).await {
            Ok(()) => {
                info!(topic = name, partitions = detail.num_partitions, replication_factor = detail.replication_factor, "topic created");
                counter!("topics_created", 1u64);
                Ok(name.to_string())
            }
            Err(TopicAdminError::AlreadyExists) => {
                debug!(topic = name, "topic already exists");
                Ok(name.to_string())
            }
            Err(e) => Err(TopicProvisionError { op: "create", topic: name.to_string(), reason: e.to_string() }),
        }
    }

    /// Ensure `name` is gone; returns the topic name.
    pub async fn delete(&self, name: &str, servers: &[String]) -> Result<String, TopicProvisionError> {
        match self.admin.delete_topic(name, servers).await {
            Ok(()) => {
                info!(topic = name, "topic deleted");
                counter!("topics_deleted", 1u64);
                Ok(name.to_string())
            }
            Err(TopicAdminError::UnknownTopic) => {
                debug!(topic = name, "topic already gone");
                Ok(name.to_string())
            }
            Err(e) => Err(TopicProvisionError { op: "delete", topic: name.to_string(), reason: e.to_string() }),
        }
    }
}

#[cfg(feature = "kafka")]
mod kafka {
    use rskafka::client::controller::ControllerClient;
    use rskafka::client::error::{Error as KafkaError, ProtocolError};
    use rskafka::client::ClientBuilder;

    use super::*;

    /// Admin client over rskafka. Connects per call, since each broker may
    /// point at a different cluster.
    #[derive(Debug, Clone)]
    pub struct RsKafkaAdmin {
        timeout_ms: i32,
    }

    impl Default for RsKafkaAdmin {
        fn default() -> Self { Self { timeout_ms: 5_000 } }
    }

    impl RsKafkaAdmin {
        pub fn new(timeout_ms: i32) -> Self { Self { timeout_ms } }

        async fn controller(&self, servers: &[String]) -> Result<ControllerClient, TopicAdminError> {
            let client = ClientBuilder::new(servers.to_vec())
                .build()
                .await
                .map_err(|e| TopicAdminError::Other(format!("connect {}: {e}", servers.join(","))))?;
            client.controller_client().map_err(|e| TopicAdminError::Other(e.to_string()))
        }
    }

    #[async_trait::async_trait]
    impl TopicAdmin for RsKafkaAdmin {
        async fn create_topic(&self, name: &str, detail: &TopicDetail, servers: &[String]) -> Result<(), TopicAdminError> {
            let controller = self.controller(servers).await?;
            match controller
                .create_topic(name, detail.num_partitions, detail.replication_factor, self.timeout_ms)
                .await
            {
                Ok(()) => Ok(()),
                Err(KafkaError::ServerError { protocol_error: ProtocolError::TopicAlreadyExists, .. }) => {
                    Err(TopicAdminError::AlreadyExists)
                }
                Err(e) => Err(TopicAdminError::Other(e.to_string())),
            }
        }

        async fn delete_topic(&self, name: &str, servers: &[String]) -> Result<(), TopicAdminError> {
            let controller = self.controller(servers).await?;
            match controller.delete_topic(name, self.timeout_ms).await {
                Ok(()) => Ok(()),
                Err(KafkaError::ServerError { protocol_error: ProtocolError::UnknownTopicOrPartition, .. }) => {
                    Err(TopicAdminError::UnknownTopic)
                }
                Err(e) => Err(TopicAdminError::Other(e.to_string())),
            }
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::RsKafkaAdmin;

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(Result<(), TopicAdminError>);

    #[async_trait::async_trait]
    impl TopicAdmin for Canned {
        async fn create_topic(&self, _: &str, _: &TopicDetail, _: &[String]) -> Result<(), TopicAdminError> { self.0.clone() }
        async fn delete_topic(&self, _: &str, _: &[String]) -> Result<(), TopicAdminError> { self.0.clone() }
    }

    fn provisioner(r: Result<(), TopicAdminError>) -> TopicProvisioner { TopicProvisioner::new(Arc::new(Canned(r))) }

    #[tokio::test]
    async fn create_is_idempotent() {
        let servers = vec!["kafka:9092".to_string()];
        let p = provisioner(Err(TopicAdminError::AlreadyExists));
        assert_eq!(p.create("t", &TopicDetail::default(), &servers).await.unwrap(), "t");
        // unknown topic is only benign on delete
        let p = provisioner(Err(TopicAdminError::UnknownTopic));
        assert!(p.create("t", &TopicDetail::default(), &servers).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let p = provisioner(Err(TopicAdminError::UnknownTopic));
        assert_eq!(p.delete("t", &[]).await.unwrap(), "t");
        let p = provisioner(Err(TopicAdminError::AlreadyExists));
        assert!(p.delete("t", &[]).await.is_err());
    }

    #[tokio::test]
    async fn other_errors_carry_context() {
        let p = provisioner(Err(TopicAdminError::Other("broker down".into())));
        let err = p.create("knative-broker-ns-b", &TopicDetail::default(), &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to create topic knative-broker-ns-b: broker down");
    }
}
