//! # Resource Lifecycle Module
//!
//! Questo modulo possiede tutti gli handle derivati e revocabili della pipeline
//! (bytes grezzi, preview, output trasformati).
//!
//! ## Responsabilità:
//! - Registra ogni risorsa e restituisce un `Handle` opaco
//! - Garantisce che ogni handle venga rilasciato esattamente una volta
//! - Un secondo `release` sullo stesso handle è un no-op, loggato come difetto
//! - Rimanda il rilascio di una preview finché il consumer non conferma il caricamento
//! - Teardown: rilascia tutti gli handle ancora vivi (anche le preview in attesa)
//!
//! ## Ordine dei rilasci per le preview:
//! ```text
//! acquire_preview ──► release (consumer non ha ancora caricato) ──► Deferred
//!                                   │
//!                      acknowledge ─┴──► Released
//! ```
//!
//! ## Esempio:
//! ```rust,ignore
//! let registry = ResourceRegistry::new();
//! let guard = registry.guard(HandleKind::Output, bytes);
//! state.store(guard.handle());
//! let handle = guard.into_handle(); // disarma il rilascio automatico
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Identifier of a registered resource, unique for the registry's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a handle backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Raw,
    Preview,
    Output,
}

/// Opaque reference to a revocable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: HandleId,
    pub kind: HandleKind,
}

/// Outcome of a release request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The resource was revoked now
    Released,
    /// Preview still awaiting its consumer, revoked on acknowledge or teardown
    Deferred,
    /// Already revoked earlier; nothing happened
    AlreadyReleased,
    /// Never issued by this registry
    Unknown,
    /// Still live, its owner has not asked for release yet
    Retained,
}

/// Callback invoked exactly once per revoked handle (the platform "revoke")
pub type ReleaseHook = Arc<dyn Fn(&Handle) + Send + Sync>;

struct Entry {
    kind: HandleKind,
    resource: Bytes,
    awaiting_ack: bool,
    release_requested: bool,
}

#[derive(Default)]
struct RegistryInner {
    live: HashMap<HandleId, Entry>,
    next_id: u64,
    released: u64,
}

/// Registry owning every derived handle of the pipeline
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    on_release: Option<ReleaseHook>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ResourceRegistry")
            .field("outstanding", &inner.live.len())
            .field("released", &inner.released)
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            on_release: None,
        }
    }

    /// Registry that calls `hook` for every handle it revokes
    pub fn with_release_hook(hook: ReleaseHook) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            on_release: Some(hook),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a resource and hand out its handle
    pub fn acquire(&self, kind: HandleKind, resource: Bytes) -> Handle {
        let mut inner = self.lock();
        let id = HandleId(inner.next_id);
        inner.next_id += 1;
        inner.live.insert(
            id,
            Entry {
                kind,
                resource,
                awaiting_ack: kind == HandleKind::Preview,
                release_requested: false,
            },
        );
        debug!("Acquired {:?} handle {}", kind, id);
        Handle { id, kind }
    }

    /// Register a resource behind a guard that releases it on drop
    pub fn guard(&self, kind: HandleKind, resource: Bytes) -> HandleGuard {
        let handle = self.acquire(kind, resource);
        HandleGuard {
            registry: self.clone(),
            handle: Some(handle),
        }
    }

    /// Bytes behind a live handle
    pub fn resolve(&self, handle: Handle) -> Result<Bytes, PipelineError> {
        let inner = self.lock();
        // una preview con rilascio differito resta leggibile per il consumer
        inner
            .live
            .get(&handle.id)
            .map(|entry| entry.resource.clone())
            .ok_or(PipelineError::ResourceRevoked(handle.id))
    }

    /// Release a handle. Previews still awaiting their consumer are deferred.
    pub fn release(&self, handle: Handle) -> ReleaseOutcome {
        let outcome = {
            let mut inner = self.lock();
            Self::release_locked(&mut inner, handle.id)
        };
        self.report(handle, outcome);
        outcome
    }

    fn release_locked(inner: &mut RegistryInner, id: HandleId) -> ReleaseOutcome {
        match inner.live.get_mut(&id) {
            Some(entry) if entry.awaiting_ack => {
                entry.release_requested = true;
                ReleaseOutcome::Deferred
            }
            Some(_) => {
                inner.live.remove(&id);
                inner.released += 1;
                ReleaseOutcome::Released
            }
            None if id.0 < inner.next_id => ReleaseOutcome::AlreadyReleased,
            None => ReleaseOutcome::Unknown,
        }
    }

    fn report(&self, handle: Handle, outcome: ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Released => {
                debug!("Released {:?} handle {}", handle.kind, handle.id);
                if let Some(hook) = &self.on_release {
                    hook(&handle);
                }
            }
            ReleaseOutcome::Deferred => {
                debug!("Deferred release of preview {} until consumer acknowledges", handle.id);
            }
            ReleaseOutcome::AlreadyReleased => {
                warn!("Double release of handle {} ignored", handle.id);
            }
            ReleaseOutcome::Unknown => {
                warn!("Release of unknown handle {} ignored", handle.id);
            }
            ReleaseOutcome::Retained => {}
        }
    }

    /// Consumer finished with a preview; performs a deferred release if one is pending
    pub fn acknowledge(&self, handle: Handle) -> ReleaseOutcome {
        let outcome = {
            let mut inner = self.lock();
            Self::acknowledge_locked(&mut inner, handle.id)
        };
        self.report(handle, outcome);
        outcome
    }

    fn acknowledge_locked(inner: &mut RegistryInner, id: HandleId) -> ReleaseOutcome {
        match inner.live.get_mut(&id) {
            Some(entry) => {
                entry.awaiting_ack = false;
                if entry.release_requested {
                    inner.live.remove(&id);
                    inner.released += 1;
                    ReleaseOutcome::Released
                } else {
                    ReleaseOutcome::Retained
                }
            }
            None if id.0 < inner.next_id => ReleaseOutcome::AlreadyReleased,
            None => ReleaseOutcome::Unknown,
        }
    }

    /// Teardown: revoke every outstanding handle, deferred previews included
    pub fn release_all(&self) -> usize {
        let drained: Vec<Handle> = {
            let mut inner = self.lock();
            let drained: Vec<Handle> = inner
                .live
                .drain()
                .map(|(id, entry)| Handle { id, kind: entry.kind })
                .collect();
            inner.released += drained.len() as u64;
            drained
        };

        for handle in &drained {
            self.report(*handle, ReleaseOutcome::Released);
        }
        if !drained.is_empty() {
            debug!("Teardown released {} handles", drained.len());
        }
        drained.len()
    }

    /// Handles still registered (deferred previews count as outstanding)
    pub fn outstanding(&self) -> usize {
        self.lock().live.len()
    }

    pub fn released_count(&self) -> u64 {
        self.lock().released
    }

    /// Handles ever issued by this registry
    pub fn issued(&self) -> u64 {
        self.lock().next_id
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.lock().live.contains_key(&handle.id)
    }
}

/// Scope guard: releases its handle on drop unless disarmed with `into_handle`
pub struct HandleGuard {
    registry: ResourceRegistry,
    handle: Option<Handle>,
}

impl HandleGuard {
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// Transfer ownership of the handle to the caller
    pub fn into_handle(mut self) -> Option<Handle> {
        self.handle.take()
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn counting_registry() -> (ResourceRegistry, Arc<StdMutex<HashMap<HandleId, u32>>>) {
        let counts: Arc<StdMutex<HashMap<HandleId, u32>>> = Arc::default();
        let sink = counts.clone();
        let registry = ResourceRegistry::with_release_hook(Arc::new(move |h: &Handle| {
            *sink.lock().unwrap().entry(h.id).or_insert(0) += 1;
        }));
        (registry, counts)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (registry, counts) = counting_registry();
        let handle = registry.acquire(HandleKind::Raw, Bytes::from_static(b"raw"));

        assert_eq!(registry.release(handle), ReleaseOutcome::Released);
        assert_eq!(registry.release(handle), ReleaseOutcome::AlreadyReleased);
        assert_eq!(counts.lock().unwrap()[&handle.id], 1);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_resolve_after_release_fails() {
        let registry = ResourceRegistry::new();
        let handle = registry.acquire(HandleKind::Output, Bytes::from_static(b"out"));
        assert_eq!(registry.resolve(handle).unwrap(), Bytes::from_static(b"out"));

        registry.release(handle);
        assert!(matches!(
            registry.resolve(handle),
            Err(PipelineError::ResourceRevoked(id)) if id == handle.id
        ));
    }

    #[test]
    fn test_preview_release_waits_for_acknowledge() {
        let (registry, counts) = counting_registry();
        let preview = registry.acquire(HandleKind::Preview, Bytes::from_static(b"img"));

        assert_eq!(registry.release(preview), ReleaseOutcome::Deferred);
        assert!(registry.is_live(preview));
        assert!(counts.lock().unwrap().is_empty());
        // il consumer può ancora leggere la preview
        assert!(registry.resolve(preview).is_ok());

        assert_eq!(registry.acknowledge(preview), ReleaseOutcome::Released);
        assert!(!registry.is_live(preview));
        assert_eq!(counts.lock().unwrap()[&preview.id], 1);
        assert_eq!(registry.acknowledge(preview), ReleaseOutcome::AlreadyReleased);
    }

    #[test]
    fn test_acknowledged_preview_releases_immediately() {
        let registry = ResourceRegistry::new();
        let preview = registry.acquire(HandleKind::Preview, Bytes::from_static(b"img"));

        assert_eq!(registry.acknowledge(preview), ReleaseOutcome::Retained);
        assert_eq!(registry.release(preview), ReleaseOutcome::Released);
    }

    #[test]
    fn test_release_all_includes_deferred_previews() {
        let (registry, counts) = counting_registry();
        let raw = registry.acquire(HandleKind::Raw, Bytes::from_static(b"a"));
        let preview = registry.acquire(HandleKind::Preview, Bytes::from_static(b"a"));
        registry.release(preview);

        assert_eq!(registry.release_all(), 2);
        assert_eq!(registry.release_all(), 0);
        assert_eq!(registry.release(raw), ReleaseOutcome::AlreadyReleased);

        let counts = counts.lock().unwrap();
        assert_eq!(counts[&raw.id], 1);
        assert_eq!(counts[&preview.id], 1);
        assert_eq!(registry.released_count(), 2);
    }

    #[test]
    fn test_guard_releases_on_drop_unless_disarmed() {
        let registry = ResourceRegistry::new();
        {
            let _guard = registry.guard(HandleKind::Output, Bytes::from_static(b"tmp"));
            assert_eq!(registry.outstanding(), 1);
        }
        assert_eq!(registry.outstanding(), 0);

        let kept = registry
            .guard(HandleKind::Output, Bytes::from_static(b"keep"))
            .into_handle()
            .unwrap();
        assert!(registry.is_live(kept));
    }

    #[test]
    fn test_unknown_handle() {
        let registry = ResourceRegistry::new();
        let other = ResourceRegistry::new();
        other.acquire(HandleKind::Raw, Bytes::new());
        let foreign = other.acquire(HandleKind::Raw, Bytes::new());
        assert_eq!(registry.release(foreign), ReleaseOutcome::Unknown);
        assert_eq!(registry.acknowledge(foreign), ReleaseOutcome::Unknown);
    }

    #[test]
    fn test_acknowledge_outcomes() {
        let (registry, counts) = counting_registry();
        let raw = registry.acquire(HandleKind::Raw, Bytes::from_static(b"r"));
        let preview = registry.acquire(HandleKind::Preview, Bytes::from_static(b"p"));

        // handle non in attesa: resta vivo
        assert_eq!(registry.acknowledge(raw), ReleaseOutcome::Retained);
        assert!(registry.is_live(raw));

        assert_eq!(registry.release(preview), ReleaseOutcome::Deferred);
        assert_eq!(registry.acknowledge(preview), ReleaseOutcome::Released);
        assert_eq!(registry.acknowledge(preview), ReleaseOutcome::AlreadyReleased);
        assert_eq!(counts.lock().unwrap().get(&preview.id), Some(&1));
        assert_eq!(registry.outstanding(), 1);
    }
}
