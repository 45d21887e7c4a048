//! Broker reconcile and finalize algorithms.

use std::sync::Arc;
use std::time::Instant;

use kbroker_core::{path, topic_name, Broker as BrokerEntry, DecodeError};
use kbroker_kubehub::Artifacts;
use kbroker_ops::{NotifyError, PodNotifier, TopicProvisioner};
use kube::runtime::events::EventType;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, ConfigResolver};
use crate::crd::{Broker, BrokerStatus};
use crate::error::{ArtifactStage, ReconcileError};
use crate::events::{reasons, EventPublisher};
use crate::resolver::DestinationResolver;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::status::StatusConditionManager;
use crate::Configs;

/// What a successful create/update pass left behind.
#[derive(Debug)]
pub struct Applied {
    pub generation: u64,
    pub topic: String,
    /// Set when dispatcher pods could not be told about `generation`.
    pub dispatcher_error: Option<NotifyError>,
}

/// Outcome of [`Engine::reconcile`]: the status to publish plus the result.
#[derive(Debug)]
pub struct ReconcileReport {
    pub status: BrokerStatus,
    pub result: Result<Applied, ReconcileError>,
}

pub struct Engine {
    artifacts: Artifacts,
    config: ConfigResolver,
    topics: TopicProvisioner,
    notifier: PodNotifier,
    resolver: Arc<dyn DestinationResolver>,
    events: Arc<dyn EventPublisher>,
    retry: RetryConfig,
    ingress_host: String,
}

impl Engine {
    pub fn new(
        configs: &Configs,
        artifacts: Artifacts,
        config: ConfigResolver,
        topics: TopicProvisioner,
        notifier: PodNotifier,
        resolver: Arc<dyn DestinationResolver>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            artifacts,
            config,
            topics,
            notifier,
            resolver,
            events,
            retry: configs.retry.clone(),
            ingress_host: configs.ingress_host.clone(),
        }
    }

    /// Bring the artifact entry and topic of `broker` in line with its spec.
    #[instrument(skip_all, fields(broker = %broker.name_or_empty(), namespace = %broker.namespace_or_default()))]
    pub async fn reconcile(&self, broker: &Broker, cancel: &CancellationToken) -> ReconcileReport {
        counter!("reconcile_attempts", 1u64);
        let started = Instant::now();

        let result = retry_on_conflict(&self.retry, "reconcile broker", cancel, |attempt| self.reconcile_once(broker, attempt)).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        let mut conditions = StatusConditionManager::new(broker.status.as_ref());
        self.record(broker, &mut conditions, &result);

        match &result {
            Ok(applied) => info!(generation = applied.generation, topic = %applied.topic, "broker reconciled"),
            Err(ReconcileError::Cancelled) => debug!("reconcile cancelled"),
            Err(e) => {
                counter!("reconcile_errors", 1u64, "kind" => e.kind());
                warn!(error = %e, "broker reconcile failed");
                self.events.publish(broker, EventType::Warning, reasons::INTERNAL_ERROR, "Reconcile", Some(e.to_string())).await;
            }
        }
        ReconcileReport { status: conditions.into_status(), result }
    }

    async fn reconcile_once(&self, broker: &Broker, attempt: u32) -> Result<Applied, ReconcileError> {
        let (namespace, name) = (broker.namespace_or_default(), broker.name_or_empty());

        let config = self.config.resolve(broker).await?;
        debug!(attempt, servers = %config.bootstrap_servers_string(), "config resolved");

        let topic = self.topics.create(&topic_name(namespace, name), &config.topic_detail, &config.bootstrap_servers).await?;

        let handle = self.artifacts.get_or_create().await.map_err(|e| ReconcileError::artifact(ArtifactStage::Get, e))?;
        let mut brokers = match self.artifacts.read(&handle) {
            Ok(b) => b,
            Err(DecodeError { partial: Some(partial), reason, .. }) => {
                warn!(%reason, kept = partial.brokers.len(), "artifact partially decoded, merging into what was recovered");
                partial
            }
            Err(e) => return Err(e.into()),
        };

        let index = brokers.find(broker.uid_or_empty());
        let entry = self.entry(broker, &topic, &config).await?;
        debug!(existing = index.is_some(), "merging broker entry");
        brokers.upsert(index, entry);
        let generation = brokers.bump_generation();

        self.artifacts
            .write(&handle, &brokers)
            .await
            .map_err(|e| ReconcileError::artifact(ArtifactStage::Update, e))?;
        debug!(generation, "artifact updated");

        // Receivers reject traffic for brokers they do not know about yet, so
        // they must see the new generation before the Broker is Ready.
        self.notifier.notify_hard(generation).await.map_err(ReconcileError::ReceiverNotification)?;
        let dispatcher_error = self.notifier.notify_soft(generation).await.err();

        Ok(Applied { generation, topic, dispatcher_error })
    }

    async fn entry(&self, broker: &Broker, topic: &str, config: &Config) -> Result<BrokerEntry, ReconcileError> {
        let mut entry = BrokerEntry {
            id: broker.uid_or_empty().to_string(),
            topic: topic.to_string(),
            path: path(broker.namespace_or_default(), broker.name_or_empty()),
            bootstrap_servers: config.bootstrap_servers_string(),
            ..Default::default()
        };
        if let Some(dls) = broker.dead_letter_sink() {
            entry.dead_letter_sink = self.resolver.resolve(dls, broker).await?;
        }
        Ok(entry)
    }

    /// Translate the outcome into conditions. Steps are strictly ordered, so
    /// every step before the failing one is known to have succeeded.
    fn record(&self, broker: &Broker, conditions: &mut StatusConditionManager, result: &Result<Applied, ReconcileError>) {
        let reached = match result {
            Ok(_) => 4,
            Err(ReconcileError::ConfigResolution(_)) => 0,
            Err(ReconcileError::TopicProvision(_)) => 1,
            Err(ReconcileError::ArtifactAccess { .. })
            | Err(ReconcileError::ArtifactConflict { .. })
            | Err(ReconcileError::MalformedArtifact(_))
            | Err(ReconcileError::DestinationResolution(_)) => 2,
            Err(ReconcileError::ReceiverNotification(_)) => 3,
            Err(_) => return,
        };
        let (namespace, name) = (broker.namespace_or_default(), broker.name_or_empty());
        if reached > 0 {
            conditions.config_resolved();
        }
        if reached > 1 {
            conditions.topic_created(&topic_name(namespace, name));
        }
        if reached > 2 {
            conditions.config_map_updated(&self.artifacts.describe());
        }
        match result {
            Ok(applied) => {
                conditions.receiver_pods_notified();
                match &applied.dispatcher_error {
                    Some(e) => conditions.mark_failure(&ReconcileError::DispatcherNotification(e.clone())),
                    None => conditions.dispatcher_pods_notified(),
                }
                conditions.addressable(format!("http://{}{}", self.ingress_host, path(namespace, name)));
            }
            Err(e) => conditions.mark_failure(e),
        }
    }

    /// Remove the broker's artifact entry and delete its topic.
    ///
    /// The generation is not bumped and pods are not notified; data-plane
    /// pods drop the entry on their next refresh.
    #[instrument(skip_all, fields(broker = %broker.name_or_empty(), namespace = %broker.namespace_or_default()))]
    pub async fn finalize(&self, broker: &Broker, cancel: &CancellationToken) -> Result<String, ReconcileError> {
        let result = retry_on_conflict(&self.retry, "finalize broker", cancel, |_| self.finalize_once(broker)).await;
        match &result {
            Ok(topic) => info!(%topic, "broker finalized"),
            Err(ReconcileError::Cancelled) => {}
            Err(e) => {
                counter!("reconcile_errors", 1u64, "kind" => e.kind());
                warn!(error = %e, "broker finalize failed");
                self.events.publish(broker, EventType::Warning, reasons::FINALIZE_FAILED, "Finalize", Some(e.to_string())).await;
            }
        }
        result
    }

    async fn finalize_once(&self, broker: &Broker) -> Result<String, ReconcileError> {
        let handle = self.artifacts.get_or_create().await.map_err(|e| ReconcileError::artifact(ArtifactStage::Get, e))?;
        let mut brokers = self.artifacts.read(&handle)?;

        if let Some(index) = brokers.find(broker.uid_or_empty()) {
            brokers.swap_remove(index);
            self.artifacts
                .write(&handle, &brokers)
                .await
                .map_err(|e| ReconcileError::artifact(ArtifactStage::Update, e))?;
            debug!(index, remaining = brokers.brokers.len(), "broker entry removed");
        }

        let config = self.config.resolve(broker).await?;
        let topic = topic_name(broker.namespace_or_default(), broker.name_or_empty());
        Ok(self.topics.delete(&topic, &config.bootstrap_servers).await?)
    }
}
