//! Handle registry.
//!
//! The engine never sees host objects directly. Instead the host registers a
//! context, hands the engine an opaque [`Handle`], and resolves that handle
//! when the engine calls back. Handles are typed by kind so an attachment
//! handle can never be passed where an operation handle is expected.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Marker trait for the kinds of object a handle can refer to.
pub trait HandleKind: 'static {
    /// Short prefix used when formatting handles in logs.
    const PREFIX: &'static str;
}

/// Handles minted for storage attachments.
#[derive(Debug)]
pub enum AttachmentKind {}

impl HandleKind for AttachmentKind {
    const PREFIX: &'static str = "att";
}

/// Handles minted for in-flight snapshot operations.
#[derive(Debug)]
pub enum OperationKind {}

impl HandleKind for OperationKind {
    const PREFIX: &'static str = "op";
}

/// Opaque, process-unique identifier of one registered context.
pub struct Handle<K> {
    raw: u64,
    _kind: PhantomData<fn() -> K>,
}

/// Handle bound to a storage attachment's event stream.
pub type AttachmentHandle = Handle<AttachmentKind>;

/// Handle bound to a snapshot operation.
pub type OperationHandle = Handle<OperationKind>;

impl<K> Handle<K> {
    fn new(raw: u64) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: HandleKind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", K::PREFIX, self.raw)
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({self})")
    }
}

/// The handle was never registered or has already been released.
///
/// Only ever observed inside the bridge; callbacks racing teardown produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryMiss;

impl fmt::Display for RegistryMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handle not registered")
    }
}

/// Maps handles to host-side contexts.
///
/// All access goes through one mutex; critical sections are short and never
/// block on I/O, so it is safe to call from engine-owned threads.
pub struct HandleRegistry<K, C> {
    next: AtomicU64,
    entries: Mutex<HashMap<Handle<K>, C>>,
}

impl<K: HandleKind, C> Default for HandleRegistry<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HandleKind, C> HandleRegistry<K, C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Handle<K>, C>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `context` to a fresh handle.
    ///
    /// # Panics
    /// Panics if the 64-bit handle space is exhausted.
    pub fn register(&self, context: C) -> Handle<K> {
        self.register_with(|_| context)
    }

    /// Like [`register`](Self::register), for contexts that need to know their own handle.
    pub fn register_with(&self, make: impl FnOnce(Handle<K>) -> C) -> Handle<K> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(raw != u64::MAX, "{} handle space exhausted", K::PREFIX);

        let handle = Handle::new(raw);
        self.entries().insert(handle, make(handle));
        tracing::trace!(%handle, "Handle registered");
        handle
    }

    /// Return a copy of the context bound to `handle`.
    pub fn resolve(&self, handle: Handle<K>) -> std::result::Result<C, RegistryMiss>
    where
        C: Clone,
    {
        self.entries().get(&handle).cloned().ok_or(RegistryMiss)
    }

    /// Run `f` against the bound context while holding the registry lock.
    ///
    /// `f` must not call back into the registry.
    pub fn with<R>(
        &self,
        handle: Handle<K>,
        f: impl FnOnce(&mut C) -> R,
    ) -> std::result::Result<R, RegistryMiss> {
        let mut entries = self.entries();
        let context = entries.get_mut(&handle).ok_or(RegistryMiss)?;
        Ok(f(context))
    }

    /// Release `handle`, returning its context if it was still live.
    ///
    /// Releasing an unknown or already released handle is a no-op.
    pub fn release(&self, handle: Handle<K>) -> Option<C> {
        let removed = self.entries().remove(&handle);
        if removed.is_some() {
            tracing::trace!(%handle, "Handle released");
        }
        removed
    }

    /// Whether `handle` is currently live.
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.entries().contains_key(&handle)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no handles are live.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Release every live handle at once.
    pub fn drain(&self) -> Vec<(Handle<K>, C)> {
        self.entries().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_register_resolve_release() {
        let registry: HandleRegistry<AttachmentKind, &str> = HandleRegistry::new();
        let handle = registry.register("disk0");

        assert_eq!(registry.resolve(handle), Ok("disk0"));
        assert_eq!(registry.release(handle), Some("disk0"));
        assert_eq!(registry.resolve(handle), Err(RegistryMiss));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry: HandleRegistry<AttachmentKind, u32> = HandleRegistry::new();
        let handle = registry.register(7);

        assert_eq!(registry.release(handle), Some(7));
        assert_eq!(registry.release(handle), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let registry: HandleRegistry<OperationKind, ()> = HandleRegistry::new();
        let first = registry.register(());
        registry.release(first);
        let second = registry.register(());
        assert_ne!(first, second);
    }

    #[test]
    fn test_with_mutates_context() {
        let registry: HandleRegistry<AttachmentKind, u32> = HandleRegistry::new();
        let handle = registry.register(1);

        let updated = registry.with(handle, |n| {
            *n += 1;
            *n
        });
        assert_eq!(updated, Ok(2));
        assert_eq!(registry.resolve(handle), Ok(2));

        registry.release(handle);
        assert_eq!(registry.with(handle, |n| *n), Err(RegistryMiss));
    }

    #[test]
    fn test_handle_display_uses_kind_prefix() {
        let attachments: HandleRegistry<AttachmentKind, ()> = HandleRegistry::new();
        let operations: HandleRegistry<OperationKind, ()> = HandleRegistry::new();

        assert_eq!(attachments.register(()).to_string(), "att-1");
        assert_eq!(operations.register(()).to_string(), "op-1");
    }

    #[test]
    fn test_concurrent_registration() {
        let registry: Arc<HandleRegistry<AttachmentKind, usize>> = Arc::new(HandleRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| registry.register(t * 100 + i))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for handle in thread.join().unwrap() {
                assert!(seen.insert(handle), "duplicate handle {handle}");
            }
        }
        assert_eq!(registry.len(), 800);
        assert_eq!(registry.drain().len(), 800);
        assert!(registry.is_empty());
    }
}
