//! Derived Handles
//!
//! A derived handle's value is a function of a keyed set of source handles.
//! It is kept in sync eagerly: every source gets a listener that recombines
//! all sources and writes the result through the derived handle's setter.
//!
//! # Ownership
//!
//! Ownership runs against the data flow. The derived handle keeps its
//! sources alive through the registry's retained-sources table, while the
//! listeners on the sources reach the derived handle and the other sources
//! only through weak references. So a chain `a -> b -> c` whose only owner is
//! a reference to `c` stays fully alive, and dropping `c` tears down `b` and
//! then `a` unless something else holds them.
//!
//! # Recombination
//!
//! A listener always reads the current value of every source when it fires,
//! not a snapshot from when it was installed. Two writes in a row to two
//! sources therefore produce two recombinations, the second one seeing both
//! new values.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::cell::Data;
use super::handle::{Handle, Unsubscribe, WeakHandle};
use super::listener::Flow;
use super::registry::{DerivationKey, Registry, Retained, RetainedSources};
use crate::clone::DeepClone;

/// Keys that can name the sources of a derivation.
pub trait SourceKey: DeepClone + Hash + Eq + Send + Sync + 'static {}

impl<K: DeepClone + Hash + Eq + Send + Sync + 'static> SourceKey for K {}

impl Registry {
    /// Build a handle whose value is `combine` applied to the current
    /// values of `inputs`.
    ///
    /// ```rust
    /// use tether_core::Registry;
    ///
    /// let registry = Registry::new();
    /// let (width, set_width) = registry.create(3);
    /// let (height, _) = registry.create(4);
    ///
    /// let area = registry.derive([("w", width), ("h", height)], |v| v["w"] * v["h"]);
    /// assert_eq!(area.value(), 12);
    ///
    /// set_width.set(5);
    /// assert_eq!(area.value(), 20);
    /// ```
    pub fn derive<K, I, T, F>(
        &self,
        inputs: impl IntoIterator<Item = (K, Handle<I>)>,
        combine: F,
    ) -> Handle<T>
    where
        K: SourceKey,
        I: Data,
        T: Data,
        F: Fn(IndexMap<K, I>) -> T + Send + Sync + 'static,
    {
        self.derive_with(inputs, combine, || {})
    }

    /// Like [`derive`](Registry::derive), running `on_die` after the derived
    /// handle has let go of its sources.
    pub fn derive_with<K, I, T, F, D>(
        &self,
        inputs: impl IntoIterator<Item = (K, Handle<I>)>,
        combine: F,
        on_die: D,
    ) -> Handle<T>
    where
        K: SourceKey,
        I: Data,
        T: Data,
        F: Fn(IndexMap<K, I>) -> T + Send + Sync + 'static,
        D: FnOnce() + Send + 'static,
    {
        let sources: IndexMap<K, Handle<I>> = inputs.into_iter().collect();
        let combine = Arc::new(combine);

        let initial = combine(current_values(&sources));

        let key = DerivationKey::new();
        let retained: RetainedSources = sources
            .values()
            .map(|source| Arc::clone(&source.core) as Retained)
            .collect();
        self.retain(key, retained);

        let subscriptions: Arc<Mutex<Vec<Unsubscribe>>> =
            Arc::new(Mutex::new(Vec::with_capacity(sources.len())));

        let on_derived_die = {
            let subscriptions = Arc::clone(&subscriptions);
            let registry = self.downgrade();
            move || {
                let subscriptions = std::mem::take(&mut *subscriptions.lock());
                for subscription in subscriptions {
                    subscription.unsubscribe();
                }
                registry.forget(key);
                on_die();
            }
        };

        let (derived, setter) = self.create_with(initial, on_derived_die);

        let weak_sources: Arc<IndexMap<K, WeakHandle<I>>> = Arc::new(
            sources
                .iter()
                .map(|(k, source)| (k.deep_clone(), source.downgrade()))
                .collect(),
        );

        for source in sources.values() {
            let weak_sources = Arc::clone(&weak_sources);
            let combine = Arc::clone(&combine);
            let setter = setter.clone();

            let subscription = source.subscribe_lazy(move |_changed: I| {
                // Sources outlive the derived handle, so a missing one means
                // the derived handle is already gone.
                let Some(values) = upgrade_values(&weak_sources) else {
                    return Flow::Stop;
                };
                if setter.set(combine(values)) {
                    Flow::Continue
                } else {
                    Flow::Stop
                }
            });
            subscriptions.lock().push(subscription);
        }

        tracing::trace!(
            registry = %self.config().name,
            handle = %derived.id(),
            sources = sources.len(),
            "derived handle created"
        );
        derived
    }

    /// Combine `inputs` into one handle holding all of their values.
    pub fn consolidate<K, I>(
        &self,
        inputs: impl IntoIterator<Item = (K, Handle<I>)>,
    ) -> Handle<IndexMap<K, I>>
    where
        K: SourceKey,
        I: Data,
    {
        self.derive(inputs, |values| values)
    }

    pub fn consolidate_with<K, I, D>(
        &self,
        inputs: impl IntoIterator<Item = (K, Handle<I>)>,
        on_die: D,
    ) -> Handle<IndexMap<K, I>>
    where
        K: SourceKey,
        I: Data,
        D: FnOnce() + Send + 'static,
    {
        self.derive_with(inputs, |values| values, on_die)
    }
}

fn current_values<K: SourceKey, I: Data>(sources: &IndexMap<K, Handle<I>>) -> IndexMap<K, I> {
    sources
        .iter()
        .map(|(k, source)| (k.deep_clone(), source.value()))
        .collect()
}

fn upgrade_values<K: SourceKey, I: Data>(
    sources: &IndexMap<K, WeakHandle<I>>,
) -> Option<IndexMap<K, I>> {
    sources
        .iter()
        .map(|(k, source)| source.upgrade().map(|h| (k.deep_clone(), h.value())))
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
