//! Liveness Registry
//!
//! The registry knows which handles are alive and what to do when one dies.
//! It keeps two tables:
//!
//! - **Finalizers**: handle ID to death callback. Inserted when a handle is
//!   created, removed and run when it dies.
//! - **Retained sources**: derivation key to the source handles of one
//!   derived handle, held strongly. An entry exists exactly as long as its
//!   derived handle is alive.
//!
//! # How Death Works
//!
//! 1. The last strong [`Handle`] clone is dropped. Its core's `Drop` calls
//!    [`Registry::release`].
//!
//! 2. `release` removes the handle's finalizer from the table and runs it.
//!    Removal before running is what makes release idempotent: a setter that
//!    finds its handle gone may call `release` again and nothing happens.
//!
//! 3. For a derived handle the finalizer unsubscribes from the sources and
//!    removes the retained entry. Dropping that entry may drop the last
//!    reference to a source, which dies in turn. Death cascades up a chain
//!    one link at a time.
//!
//! No table lock is held while a finalizer runs or a retained entry drops,
//! so the cascade can re-enter the registry.
//!
//! # Ownership
//!
//! A registry is an ordinary value created at the composition root and
//! passed around. Every handle holds a clone, so the tables live as long as
//! the longest-lived handle.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::cell::{Data, ValueCell};
use super::handle::{Core, Handle, HandleId, Setter};
use crate::config::RegistryConfig;

/// Identifies one derivation's entry in the retained-sources table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationKey(u64);

impl DerivationKey {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for DerivationKey {
    fn default() -> Self {
        Self::new()
    }
}

/// A strongly held source handle, type-erased.
pub(crate) type Retained = Arc<dyn Any + Send + Sync>;

pub(crate) type RetainedSources = SmallVec<[Retained; 4]>;

/// A death callback that runs at most once.
struct Finalizer(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Finalizer {
    fn new<F>(on_die: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Mutex::new(Some(Box::new(on_die))))
    }

    fn run(&self) {
        // Taken out first so the callback runs without the lock held.
        let on_die = self.0.lock().take();
        if let Some(on_die) = on_die {
            on_die();
        }
    }
}

pub(crate) struct RegistryInner {
    config: Arc<RegistryConfig>,
    finalizers: DashMap<HandleId, Finalizer>,
    retained: DashMap<DerivationKey, RetainedSources>,
}

/// Tracks handle liveness and dispatches death callbacks.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config: Arc::new(config),
                finalizers: DashMap::new(),
                retained: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Create a handle with no death callback.
    pub fn create<T: Data>(&self, initial: T) -> (Handle<T>, Setter<T>) {
        self.create_with(initial, || {})
    }

    /// Create a handle and register `on_die` to run when it dies.
    ///
    /// The returned setter does not keep the handle alive.
    pub fn create_with<T, F>(&self, initial: T, on_die: F) -> (Handle<T>, Setter<T>)
    where
        T: Data,
        F: FnOnce() + Send + 'static,
    {
        let id = HandleId::new();
        let cell = ValueCell::new(id, &initial, Arc::clone(&self.inner.config));

        self.inner.finalizers.insert(id, Finalizer::new(on_die));

        let handle = Handle {
            core: Arc::new(Core {
                id,
                cell,
                registry: self.clone(),
            }),
        };
        let setter = Setter::new(&handle);

        tracing::trace!(registry = %self.inner.config.name, handle = %id, "handle created");
        (handle, setter)
    }

    /// Run a handle's death callback if it has not run yet.
    pub(crate) fn release(&self, id: HandleId) {
        let Some((_, finalizer)) = self.inner.finalizers.remove(&id) else {
            return;
        };

        tracing::trace!(registry = %self.inner.config.name, handle = %id, "handle released");

        // This usually runs inside a destructor; a panic must not escape.
        if catch_unwind(AssertUnwindSafe(|| finalizer.run())).is_err() {
            tracing::error!(
                registry = %self.inner.config.name,
                handle = %id,
                "death callback panicked"
            );
        }
    }

    /// Hold `sources` strongly under `key`.
    pub(crate) fn retain(&self, key: DerivationKey, sources: RetainedSources) {
        self.inner.retained.insert(key, sources);
    }

    /// A non-owning reference for death callbacks, which live in this
    /// registry's own tables.
    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the handle with this ID is alive.
    pub fn is_alive(&self, id: HandleId) -> bool {
        self.inner.finalizers.contains_key(&id)
    }

    /// Number of live handles.
    pub fn live_handles(&self) -> usize {
        self.inner.finalizers.len()
    }

    /// Number of live derived handles holding their sources.
    pub fn retained_chains(&self) -> usize {
        self.inner.retained.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.inner.config.name)
            .field("live_handles", &self.live_handles())
            .field("retained_chains", &self.retained_chains())
            .finish()
    }
}

pub(crate) struct WeakRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakRegistry {
    /// Drop the retained sources under `key`. Idempotent.
    pub(crate) fn forget(&self, key: DerivationKey) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // Bound to a local so the shard lock is released before the sources
        // drop and possibly cascade back into the registry.
        let removed = inner.retained.remove(&key);
        drop(removed);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn registry_registers_and_releases() {
        let registry = Registry::new();
        let (handle, _set) = registry.create(0);
        let id = handle.id();

        assert!(registry.is_alive(id));
        assert_eq!(registry.live_handles(), 1);

        drop(handle);

        assert!(!registry.is_alive(id));
        assert_eq!(registry.live_handles(), 0);
    }

    #[test]
    fn clones_keep_handle_alive() {
        let registry = Registry::new();
        let died = Arc::new(AtomicI32::new(0));
        let died_clone = died.clone();

        let (handle, _set) = registry.create_with(0, move || {
            died_clone.fetch_add(1, Ordering::SeqCst);
        });
        let other = handle.clone();

        drop(handle);
        assert_eq!(died.load(Ordering::SeqCst), 0);

        drop(other);
        assert_eq!(died.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let registry = Registry::new();
        let died = Arc::new(AtomicI32::new(0));
        let died_clone = died.clone();

        let (handle, _set) = registry.create_with(0, move || {
            died_clone.fetch_add(1, Ordering::SeqCst);
        });
        let id = handle.id();

        drop(handle);
        registry.release(id);
        registry.release(id);

        assert_eq!(died.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_death_callback_is_contained() {
        let registry = Registry::new();
        let (handle, _set) = registry.create_with(0, || panic!("cleanup failed"));
        let id = handle.id();

        drop(handle);
        assert!(!registry.is_alive(id));
    }

    #[test]
    fn forget_drops_retained_sources() {
        let registry = Registry::new();
        let (source, _set) = registry.create(1);
        let id = source.id();
        let key = DerivationKey::new();

        let mut sources = RetainedSources::new();
        sources.push(source.core.clone() as Retained);
        registry.retain(key, sources);
        drop(source);

        assert!(registry.is_alive(id));
        assert_eq!(registry.retained_chains(), 1);

        registry.downgrade().forget(key);
        registry.downgrade().forget(key);

        assert!(!registry.is_alive(id));
        assert_eq!(registry.retained_chains(), 0);
    }

    #[test]
    fn config_reaches_registry() {
        let registry = Registry::with_config(RegistryConfig::default().with_name("ui"));
        assert_eq!(registry.config().name, "ui");
    }
}
