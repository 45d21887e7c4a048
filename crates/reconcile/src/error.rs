use std::time::Duration;

use kbroker_core::codec::DecodeError;
use kbroker_kubehub::ArtifactError;
use kbroker_ops::{NotifyError, TopicProvisionError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::resolver::ResolveError;

/// Everything that can stop a Broker reconcile.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to resolve broker config: {0}")]
    ConfigResolution(#[from] ConfigError),

    #[error(transparent)]
    TopicProvision(#[from] TopicProvisionError),

    #[error("failed to {stage} artifact: {source}")]
    ArtifactAccess { stage: ArtifactStage, source: ArtifactError },

    #[error("artifact {artifact} still conflicting after {attempts} attempts")]
    ArtifactConflict { artifact: String, attempts: u32 },

    #[error("failed to get brokers and triggers data: {0}")]
    MalformedArtifact(#[from] DecodeError),

    #[error("failed to resolve dead-letter sink: {0}")]
    DestinationResolution(#[from] ResolveError),

    #[error(transparent)]
    ReceiverNotification(NotifyError),

    #[error(transparent)]
    DispatcherNotification(NotifyError),

    #[error("reconcile cancelled")]
    Cancelled,

    #[error("failed to update broker status: {0}")]
    Status(#[source] kube::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStage {
    Get,
    Update,
}

impl std::fmt::Display for ArtifactStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactStage::Get => f.write_str("get"),
            ArtifactStage::Update => f.write_str("update"),
        }
    }
}

impl ReconcileError {
    /// Wrap an artifact error; a conflict on update becomes `ArtifactConflict`
    /// so the retry loop can recognize it.
    pub fn artifact(stage: ArtifactStage, source: ArtifactError) -> Self {
        match source {
            ArtifactError::Conflict { artifact } => ReconcileError::ArtifactConflict { artifact, attempts: 1 },
            source => ReconcileError::ArtifactAccess { stage, source },
        }
    }

    pub fn is_conflict(&self) -> bool { matches!(self, ReconcileError::ArtifactConflict { .. }) }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::ConfigResolution(_) => "config",
            ReconcileError::TopicProvision(_) => "topic",
            ReconcileError::ArtifactAccess { .. } => "artifact",
            ReconcileError::ArtifactConflict { .. } => "conflict",
            ReconcileError::MalformedArtifact(_) => "malformed",
            ReconcileError::DestinationResolution(_) => "destination",
            ReconcileError::ReceiverNotification(_) => "receiver",
            ReconcileError::DispatcherNotification(_) => "dispatcher",
            ReconcileError::Cancelled => "cancelled",
            ReconcileError::Status(_) => "status",
        }
    }

    /// Requeue delay for the controller's error policy.
    pub fn requeue_after(&self) -> Duration {
        match self {
            ReconcileError::ConfigResolution(ConfigError::UnsupportedKind(_)) => Duration::from_secs(300),
            ReconcileError::ConfigResolution(_) | ReconcileError::DestinationResolution(_) => Duration::from_secs(30),
            ReconcileError::ArtifactConflict { .. } => Duration::from_secs(1),
            _ => Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_recognized() {
        let e = ReconcileError::artifact(ArtifactStage::Update, ArtifactError::Conflict { artifact: "ns/cm".into() });
        assert!(e.is_conflict());
        let e = ReconcileError::artifact(ArtifactStage::Get, ArtifactError::Access { artifact: "ns/cm".into(), reason: "forbidden".into() });
        assert!(!e.is_conflict());
        assert_eq!(e.to_string(), "failed to get artifact: failed to access artifact ns/cm: forbidden");
    }

    #[test]
    fn unsupported_kind_backs_off_longer() {
        let e = ReconcileError::from(ConfigError::UnsupportedKind("Pod".into()));
        assert!(e.requeue_after() > ReconcileError::Cancelled.requeue_after());
    }
}
