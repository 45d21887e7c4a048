//! Broker status conditions. Pure state transitions, no API calls.

use chrono::{SecondsFormat, Utc};

use crate::crd::{Address, BrokerStatus, Condition};
use crate::error::{ArtifactStage, ReconcileError};

pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const CONFIG_PARSED: &str = "ConfigParsed";
    pub const TOPIC_READY: &str = "TopicReady";
    pub const CONFIG_MAP_UPDATED: &str = "ConfigMapUpdated";
    pub const RECEIVER_PODS_NOTIFIED: &str = "ReceiverPodsNotified";
    pub const DISPATCHER_PODS_NOTIFIED: &str = "DispatcherPodsNotified";
    pub const ADDRESSABLE: &str = "Addressable";
}

pub mod condition_reasons {
    pub const FAILED_TO_RESOLVE_CONFIG: &str = "FailedToResolveConfig";
    pub const FAILED_TO_CREATE_TOPIC: &str = "FailedToCreateTopic";
    pub const FAILED_TO_GET_CONFIG_MAP: &str = "FailedToGetConfigMap";
    pub const FAILED_TO_GET_CONFIG_MAP_DATA: &str = "FailedToGetConfigMapData";
    pub const FAILED_TO_RESOLVE_DEAD_LETTER_SINK: &str = "FailedToResolveDeadLetterSink";
    pub const FAILED_TO_UPDATE_CONFIG_MAP: &str = "FailedToUpdateConfigMap";
    pub const FAILED_TO_UPDATE_RECEIVER_PODS_ANNOTATION: &str = "FailedToUpdateReceiverPodsAnnotation";
    pub const FAILED_TO_UPDATE_DISPATCHER_PODS_ANNOTATION: &str = "FailedToUpdateDispatcherPodsAnnotation";
}

use condition_reasons::*;
use condition_types::*;

/// Conditions that must all be true for the Broker to be Ready.
pub const READY_DEPENDENTS: [&str; 5] = [CONFIG_PARSED, TOPIC_READY, CONFIG_MAP_UPDATED, RECEIVER_PODS_NOTIFIED, ADDRESSABLE];

const TRUE: &str = "True";
const FALSE: &str = "False";
const UNKNOWN: &str = "Unknown";

pub struct StatusConditionManager {
    status: BrokerStatus,
    now: String,
}

impl StatusConditionManager {
    /// Start from the previous status so unchanged conditions keep their
    /// transition time.
    pub fn new(previous: Option<&BrokerStatus>) -> Self {
        let mut me = Self {
            status: previous.cloned().unwrap_or_default(),
            now: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        for t in READY_DEPENDENTS.iter().chain([READY, DISPATCHER_PODS_NOTIFIED].iter()) {
            if me.get(t).is_none() {
                me.set(t, UNKNOWN, None, None);
            }
        }
        me.recompute_ready();
        me
    }

    pub fn status(&self) -> &BrokerStatus { &self.status }
    pub fn into_status(self) -> BrokerStatus { self.status }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool { self.get(type_).is_some_and(|c| c.status == TRUE) }

    pub fn is_ready(&self) -> bool { self.is_true(READY) }

    pub fn config_resolved(&mut self) { self.mark_true(CONFIG_PARSED) }

    pub fn topic_created(&mut self, topic: &str) {
        self.set(TOPIC_READY, TRUE, Some("TopicCreated"), Some(format!("topic {topic} created")));
        self.recompute_ready();
    }

    pub fn config_map_updated(&mut self, artifact: &str) {
        self.set(CONFIG_MAP_UPDATED, TRUE, Some("ConfigMapUpdated"), Some(format!("config map {artifact} updated")));
        self.recompute_ready();
    }

    pub fn receiver_pods_notified(&mut self) { self.mark_true(RECEIVER_PODS_NOTIFIED) }

    pub fn dispatcher_pods_notified(&mut self) { self.mark_true(DISPATCHER_PODS_NOTIFIED) }

    pub fn addressable(&mut self, url: String) {
        self.status.address = Some(Address { url: Some(url) });
        self.mark_true(ADDRESSABLE);
    }

    /// Record `err` on the condition of the step that produced it.
    pub fn mark_failure(&mut self, err: &ReconcileError) {
        let msg = Some(err.to_string());
        let (type_, reason) = match err {
            ReconcileError::ConfigResolution(_) => (CONFIG_PARSED, FAILED_TO_RESOLVE_CONFIG),
            ReconcileError::TopicProvision(_) => (TOPIC_READY, FAILED_TO_CREATE_TOPIC),
            ReconcileError::ArtifactAccess { stage: ArtifactStage::Get, .. } => (CONFIG_MAP_UPDATED, FAILED_TO_GET_CONFIG_MAP),
            ReconcileError::ArtifactAccess { stage: ArtifactStage::Update, .. } | ReconcileError::ArtifactConflict { .. } => {
                (CONFIG_MAP_UPDATED, FAILED_TO_UPDATE_CONFIG_MAP)
            }
            ReconcileError::MalformedArtifact(_) => (CONFIG_MAP_UPDATED, FAILED_TO_GET_CONFIG_MAP_DATA),
            ReconcileError::DestinationResolution(_) => (CONFIG_MAP_UPDATED, FAILED_TO_RESOLVE_DEAD_LETTER_SINK),
            ReconcileError::ReceiverNotification(_) => (RECEIVER_PODS_NOTIFIED, FAILED_TO_UPDATE_RECEIVER_PODS_ANNOTATION),
            ReconcileError::DispatcherNotification(_) => {
                (DISPATCHER_PODS_NOTIFIED, FAILED_TO_UPDATE_DISPATCHER_PODS_ANNOTATION)
            }
            ReconcileError::Cancelled | ReconcileError::Status(_) => return,
        };
        self.set(type_, FALSE, Some(reason), msg);
        if type_ == DISPATCHER_PODS_NOTIFIED {
            self.set_severity(type_, "Info");
        }
        self.recompute_ready();
    }

    fn mark_true(&mut self, type_: &str) {
        self.set(type_, TRUE, None, None);
        self.recompute_ready();
    }

    fn recompute_ready(&mut self) {
        let failed = READY_DEPENDENTS
            .iter()
            .filter_map(|t| self.get(t))
            .find(|c| c.status == FALSE)
            .map(|c| (c.reason.clone(), c.message.clone()));
        if let Some((reason, message)) = failed {
            self.set(READY, FALSE, reason.as_deref(), message);
        } else if READY_DEPENDENTS.iter().all(|t| self.is_true(t)) {
            self.set(READY, TRUE, None, None);
        } else {
            self.set(READY, UNKNOWN, None, None);
        }
    }

    fn set(&mut self, type_: &str, status: &str, reason: Option<&str>, message: Option<String>) {
        let now = self.now.clone();
        let reason = reason.map(str::to_string);
        match self.status.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = Some(now);
                }
                c.status = status.to_string();
                c.reason = reason;
                c.message = message;
                c.severity = None;
            }
            None => self.status.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                severity: None,
                last_transition_time: Some(now),
                reason,
                message,
            }),
        }
    }

    fn set_severity(&mut self, type_: &str, severity: &str) {
        if let Some(c) = self.status.conditions.iter_mut().find(|c| c.type_ == type_) {
            c.severity = Some(severity.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use kbroker_ops::{NotifyError, PodClass};

    fn all_good() -> StatusConditionManager {
        let mut m = StatusConditionManager::new(None);
        m.config_resolved();
        m.topic_created("knative-broker-ns-b");
        m.config_map_updated("knative-eventing/kafka-broker-brokers-triggers");
        m.receiver_pods_notified();
        m.addressable("http://ingress/ns/b".into());
        m
    }

    #[test]
    fn starts_unknown() {
        let m = StatusConditionManager::new(None);
        assert_eq!(m.get(READY).unwrap().status, UNKNOWN);
        assert_eq!(m.status().conditions.len(), 7);
    }

    #[test]
    fn ready_when_all_dependents_true() {
        let m = all_good();
        assert!(m.is_ready());
        assert_eq!(m.status().address.as_ref().unwrap().url.as_deref(), Some("http://ingress/ns/b"));
    }

    #[test]
    fn dispatcher_failure_does_not_gate_ready() {
        let mut m = all_good();
        m.mark_failure(&ReconcileError::DispatcherNotification(NotifyError { class: PodClass::Dispatcher, failures: vec![] }));
        assert!(m.is_ready());
        let c = m.get(DISPATCHER_PODS_NOTIFIED).unwrap();
        assert_eq!(c.status, FALSE);
        assert_eq!(c.severity.as_deref(), Some("Info"));
        assert_eq!(c.reason.as_deref(), Some(FAILED_TO_UPDATE_DISPATCHER_PODS_ANNOTATION));
    }

    #[test]
    fn failure_propagates_to_ready() {
        let mut m = all_good();
        m.mark_failure(&ReconcileError::ConfigResolution(ConfigError::UnsupportedKind("Pod".into())));
        assert!(!m.is_ready());
        let ready = m.get(READY).unwrap();
        assert_eq!(ready.status, FALSE);
        assert_eq!(ready.reason.as_deref(), Some(FAILED_TO_RESOLVE_CONFIG));
        assert_eq!(m.get(CONFIG_PARSED).unwrap().reason.as_deref(), Some(FAILED_TO_RESOLVE_CONFIG));
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let mut prev = all_good().into_status();
        for c in prev.conditions.iter_mut() {
            c.last_transition_time = Some("2020-01-01T00:00:00Z".into());
        }
        let m = StatusConditionManager::new(Some(&prev));
        let mut m2 = m;
        m2.config_resolved();
        assert_eq!(m2.get(CONFIG_PARSED).unwrap().last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }
}
