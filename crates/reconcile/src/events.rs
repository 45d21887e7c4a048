//! Kubernetes Event recording for Broker reconciles.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile.

use std::sync::Mutex;

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::Broker;

pub mod reasons {
    /// Any fatal reconcile failure.
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const FINALIZE_FAILED: &str = "FinalizeFailed";
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, broker: &Broker, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self { client, reporter: Reporter { controller: controller_name.to_string(), instance: std::env::var("POD_NAME").ok() } }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, broker: &Broker, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), broker.object_ref(&()));
        let event = Event { type_, reason: reason.to_string(), note, action: action.to_string(), secondary: None };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Keeps every event in memory; handy for asserting on what a reconcile reported.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub broker: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, broker: &Broker, type_: EventType, reason: &str, _action: &str, note: Option<String>) {
        let ev = RecordedEvent {
            broker: broker.name_or_empty().to_string(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        };
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(ev);
    }
}
