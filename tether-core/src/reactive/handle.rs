//! Reactive Handles
//!
//! A [`Handle`] is the public face of a cell. Clones of a handle share the
//! same cell; the handle is alive exactly as long as at least one clone (or
//! a derived handle that depends on it) exists. When the last one goes, the
//! registry runs the handle's death callback.
//!
//! The [`Setter`] returned next to a handle does not keep it alive. Once the
//! handle is dead every `set` returns `false` and has no effect.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use super::cell::{Data, ListenerSet, ValueCell};
use super::listener::{Flow, IntoReply, ListenerId};
use super::registry::Registry;
use crate::clone::{DeepClone, Value};
use crate::error::{Error, Result};

/// Unique identifier for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Generate a new unique handle ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// The shared state behind all clones of one handle.
///
/// Dropping it is the handle's death.
pub(crate) struct Core<T: Data> {
    pub(crate) id: HandleId,
    pub(crate) cell: Arc<ValueCell<T>>,
    pub(crate) registry: Registry,
}

impl<T: Data> Drop for Core<T> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// A reactive container.
///
/// # Example
///
/// ```rust
/// use tether_core::Registry;
///
/// let registry = Registry::new();
/// let (count, set_count) = registry.create(0);
///
/// let doubled = count.transform(|n| n * 2);
/// set_count.set(4);
/// assert_eq!(doubled.value(), 8);
/// ```
pub struct Handle<T: Data> {
    pub(crate) core: Arc<Core<T>>,
}

impl<T: Data> Handle<T> {
    pub fn id(&self) -> HandleId {
        self.core.id
    }

    /// Get a deep clone of the current value.
    pub fn value(&self) -> T {
        self.core.cell.read()
    }

    /// Subscribe and receive the current value right away.
    pub fn subscribe<F, R>(&self, listener: F) -> Unsubscribe
    where
        F: FnMut(T) -> R + Send + 'static,
        R: IntoReply,
    {
        self.subscribe_with(listener, true)
    }

    /// Subscribe without an initial notification; the first value arrives
    /// with the next write.
    pub fn subscribe_lazy<F, R>(&self, listener: F) -> Unsubscribe
    where
        F: FnMut(T) -> R + Send + 'static,
        R: IntoReply,
    {
        self.subscribe_with(listener, false)
    }

    fn subscribe_with<F, R>(&self, listener: F, immediate: bool) -> Unsubscribe
    where
        F: FnMut(T) -> R + Send + 'static,
        R: IntoReply,
    {
        let id = self.core.cell.subscribe(listener, immediate);
        let cell: Weak<ValueCell<T>> = Arc::downgrade(&self.core.cell);
        Unsubscribe {
            cell: cell as Weak<dyn ListenerSet>,
            id,
        }
    }

    /// Resolve with the first `Some` the predicate returns.
    ///
    /// The predicate sees the current value immediately and then every
    /// later one. The returned future keeps this handle alive until it
    /// resolves or is dropped. A dropped future unsubscribes on the next
    /// notification.
    pub fn wait<R, P>(&self, mut predicate: P) -> impl Future<Output = Result<R>> + Send + 'static
    where
        R: Send + 'static,
        P: FnMut(T) -> Option<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        self.subscribe(move |value: T| {
            if tx.as_ref().map_or(true, |tx| tx.is_closed()) {
                return Flow::Stop;
            }
            match predicate(value) {
                Some(found) => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(found);
                    }
                    Flow::Stop
                }
                None => Flow::Continue,
            }
        });

        let keep_alive = self.clone();
        async move {
            let resolved = rx.await.map_err(|_| Error::WaitAbandoned(keep_alive.id()));
            drop(keep_alive);
            resolved
        }
    }

    /// Build a handle whose value is `f` applied to this one's.
    ///
    /// Equivalent to a one-source derivation over this handle.
    pub fn transform<R, F>(&self, f: F) -> Handle<R>
    where
        R: Data,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        self.core
            .registry
            .derive([((), self.clone())], move |values| f(values[&()].deep_clone()))
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Get the number of listeners on this handle's cell.
    pub fn listener_count(&self) -> usize {
        self.core.cell.listener_count()
    }

    /// The registry that tracks this handle.
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }
}

impl<T: Data + Presence> Handle<T> {
    /// Resolve with the value once it is present.
    pub fn load(&self) -> impl Future<Output = Result<T::Present>> + Send + 'static {
        self.wait(T::present)
    }
}

impl<T: Data> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Handle<T>
where
    T: Data + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.core.id)
            .field("value", &self.value())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// A non-owning reference to a handle.
pub struct WeakHandle<T: Data> {
    core: Weak<Core<T>>,
}

impl<T: Data> WeakHandle<T> {
    pub fn upgrade(&self) -> Option<Handle<T>> {
        self.core.upgrade().map(|core| Handle { core })
    }
}

impl<T: Data> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

/// Write access to one handle that does not keep it alive.
pub struct Setter<T: Data> {
    id: HandleId,
    core: Weak<Core<T>>,
    registry: Registry,
}

impl<T: Data> Setter<T> {
    pub(crate) fn new(handle: &Handle<T>) -> Self {
        Self {
            id: handle.core.id,
            core: Arc::downgrade(&handle.core),
            registry: handle.core.registry.clone(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Write a new value and notify listeners.
    ///
    /// Returns `false`, without effect, once the handle is dead.
    pub fn set(&self, value: T) -> bool {
        match self.core.upgrade() {
            Some(core) => core.cell.write(&value),
            None => {
                // Release is idempotent; this covers a death the registry
                // has not processed yet.
                self.registry.release(self.id);
                false
            }
        }
    }

    /// Write a value computed from the current one.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(T) -> T,
    {
        match self.core.upgrade() {
            Some(core) => {
                let next = f(core.cell.read());
                core.cell.write(&next)
            }
            None => {
                self.registry.release(self.id);
                false
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }
}

impl<T: Data> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            core: Weak::clone(&self.core),
            registry: self.registry.clone(),
        }
    }
}

impl<T: Data> fmt::Debug for Setter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setter")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Removes one listener from one cell.
///
/// Holds only a weak reference to the cell. Dropping it leaves the
/// subscription in place.
#[derive(Clone)]
pub struct Unsubscribe {
    cell: Weak<dyn ListenerSet>,
    id: ListenerId,
}

impl Unsubscribe {
    pub fn listener_id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.remove(self.id);
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}

/// Types with a notion of "value is present", used by [`Handle::load`].
pub trait Presence {
    type Present: Send + 'static;

    fn present(self) -> Option<Self::Present>;
}

impl<U: Send + 'static> Presence for Option<U> {
    type Present = U;

    fn present(self) -> Option<U> {
        self
    }
}

impl Presence for Value {
    type Present = Value;

    fn present(self) -> Option<Value> {
        (!self.is_null()).then_some(self)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
