//! In-RAM artifact store with the same compare-and-swap semantics as the
//! ConfigMap-backed one. Used by tests and local dry runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kbroker_kubehub::{ArtifactError, ArtifactHandle, ArtifactStore};

#[derive(Debug, Default)]
struct Slot {
    payload: Vec<u8>,
    version: u64,
}

pub struct MemoryArtifacts {
    name: String,
    slot: Mutex<Option<Slot>>,
    updates: AtomicU64,
    creates: AtomicU64,
}

impl MemoryArtifacts {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), slot: Mutex::new(None), updates: AtomicU64::new(0), creates: AtomicU64::new(0) }
    }

    /// Pre-populate the artifact as if some earlier writer had stored `payload`.
    pub fn seeded(name: &str, payload: Vec<u8>) -> Self {
        let me = Self::new(name);
        *me.lock() = Some(Slot { payload, version: 1 });
        me
    }

    /// Current payload, `None` until the artifact exists.
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.lock().as_ref().map(|s| s.payload.clone())
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> u64 { self.updates.load(Ordering::SeqCst) }
    pub fn create_count(&self) -> u64 { self.creates.load(Ordering::SeqCst) }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn handle(slot: &Slot) -> ArtifactHandle {
    ArtifactHandle {
        payload: if slot.payload.is_empty() { None } else { Some(slot.payload.clone()) },
        version: Some(slot.version.to_string()),
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    fn describe(&self) -> String { format!("memory/{}", self.name) }

    async fn get_or_create(&self) -> Result<ArtifactHandle, ArtifactError> {
        let mut guard = self.lock();
        let slot = guard.get_or_insert_with(|| {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Slot { payload: Vec::new(), version: 1 }
        });
        Ok(handle(slot))
    }

    async fn update(&self, expected: &ArtifactHandle, payload: Vec<u8>) -> Result<ArtifactHandle, ArtifactError> {
        let mut guard = self.lock();
        let Some(slot) = guard.as_mut() else {
            return Err(ArtifactError::Access { artifact: self.describe(), reason: "not found".into() });
        };
        if expected.version.as_deref() != Some(slot.version.to_string().as_str()) {
            return Err(ArtifactError::Conflict { artifact: self.describe() });
        }
        slot.payload = payload;
        slot.version += 1;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(handle(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update() {
        let store = MemoryArtifacts::new("cm");
        let h = store.get_or_create().await.unwrap();
        assert_eq!(h.payload, None);
        let h2 = store.update(&h, b"x".to_vec()).await.unwrap();
        assert_eq!(h2.payload.as_deref(), Some(&b"x"[..]));
        assert_eq!(store.create_count(), 1);
        store.get_or_create().await.unwrap();
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn stale_handle_conflicts() {
        let store = MemoryArtifacts::seeded("cm", b"a".to_vec());
        let stale = store.get_or_create().await.unwrap();
        let fresh = store.get_or_create().await.unwrap();
        store.update(&fresh, b"b".to_vec()).await.unwrap();
        let err = store.update(&stale, b"c".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.payload().unwrap(), b"b".to_vec());
        assert_eq!(store.update_count(), 1);
    }
}
