//! Value Cell
//!
//! A cell holds the current value of one handle and the listeners subscribed
//! to it. It is the only place that value is stored, and it never hands out
//! references into it: reads return a deep clone, writes store a deep clone.
//!
//! # Broadcasting
//!
//! A write stores the value, then walks a snapshot of the listener list in
//! subscription order. No lock is held while a listener runs, so listeners
//! may read the cell, write other cells, subscribe or unsubscribe freely.
//!
//! Each listener gets its own deep clone of the value current at its turn.
//! A synchronous reply is settled on the spot. A suspended reply is handed to
//! the tokio runtime and settled when it finishes; the write does not wait.
//!
//! Settling means: `Stop` removes the listener, `Continue` does nothing, and
//! an error is logged while the listener stays subscribed.
//!
//! A listener is never re-entered. A write that reaches a listener while it
//! is still running (because it wrote back into its own cell, directly or
//! around a cycle) marks it pending, and the running dispatch hands it the
//! newest value as soon as the call returns.
//!
//! # Thread Safety
//!
//! The value sits behind a `parking_lot::RwLock` and the listener list behind
//! a `parking_lot::Mutex`. The intended model is single-threaded, but the
//! cell is `Send + Sync` so suspended listeners can run on tokio.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::context::DispatchContext;
use super::listener::{self, ListenerError, ListenerId, Outcome, Reply, SharedListener};
use super::{Flow, HandleId, IntoReply};
use crate::clone::DeepClone;
use crate::config::RegistryConfig;

/// Values that can live in a cell.
pub trait Data: DeepClone + Send + Sync + 'static {}

impl<T: DeepClone + Send + Sync + 'static> Data for T {}

/// Something listeners can be removed from by ID.
pub(crate) trait ListenerSet: Send + Sync {
    fn remove(&self, id: ListenerId) -> bool;
}

/// Storage and broadcast for one handle's value.
pub struct ValueCell<T: Data> {
    /// The handle this cell belongs to.
    handle: HandleId,

    value: RwLock<T>,

    /// Subscribed listeners in subscription order.
    listeners: Mutex<IndexMap<ListenerId, SharedListener<T>>>,

    config: Arc<RegistryConfig>,

    /// Back-reference for suspended listeners, which outlive the call that
    /// dispatched them.
    this: Weak<ValueCell<T>>,
}

impl<T: Data> ValueCell<T> {
    /// Create a cell seeded with a deep clone of `initial`.
    pub(crate) fn new(handle: HandleId, initial: &T, config: Arc<RegistryConfig>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            handle,
            value: RwLock::new(initial.deep_clone()),
            listeners: Mutex::new(IndexMap::new()),
            config,
            this: this.clone(),
        })
    }

    /// Get a deep clone of the current value.
    pub fn read(&self) -> T {
        self.value.read().deep_clone()
    }

    /// Store a deep clone of `value` and notify every listener.
    ///
    /// Always succeeds. Listener failures are logged, never returned.
    pub fn write(&self, value: &T) -> bool {
        *self.value.write() = value.deep_clone();

        let snapshot: Vec<(ListenerId, SharedListener<T>)> = self
            .listeners
            .lock()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in snapshot {
            // An earlier listener in this burst may have unsubscribed it.
            if !self.listeners.lock().contains_key(&id) {
                continue;
            }
            self.dispatch(id, &listener);
        }

        true
    }

    /// Register a listener, optionally notifying it right away.
    pub fn subscribe<F, R>(&self, listener: F, immediate: bool) -> ListenerId
    where
        F: FnMut(T) -> R + Send + 'static,
        R: IntoReply,
    {
        let id = ListenerId::new();
        let listener = listener::share(listener);
        self.listeners.lock().insert(id, Arc::clone(&listener));

        if immediate {
            self.dispatch(id, &listener);
        }
        id
    }

    /// Remove a listener. Removing an unknown ID is a no-op.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().shift_remove(&id).is_some()
    }

    /// Get the number of listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver the current value to one listener.
    fn dispatch(&self, id: ListenerId, listener: &SharedListener<T>) {
        let Some(_frame) = DispatchContext::enter(
            self.handle,
            self.config.max_dispatch_depth,
            self.config.max_reentries,
        ) else {
            tracing::warn!(
                registry = %self.config.name,
                handle = %self.handle,
                listener = %id,
                depth = DispatchContext::depth(),
                reentries = DispatchContext::occurrences(self.handle),
                "dispatch limit reached; notification dropped"
            );
            return;
        };

        // Held further up this thread's stack: the listener wrote, directly
        // or through other cells, back into this one. It gets the newest
        // value once that call returns.
        let Some(mut call) = listener.call.try_lock() else {
            listener.pending.store(true, Ordering::Release);
            tracing::debug!(
                registry = %self.config.name,
                handle = %self.handle,
                listener = %id,
                "listener is already running; notification deferred"
            );
            return;
        };

        let mut redelivered = 0;
        loop {
            listener.pending.store(false, Ordering::Release);

            let value = self.read();
            let reply = catch_unwind(AssertUnwindSafe(|| (*call)(value)));
            match reply {
                Ok(Reply::Now(outcome)) => self.settle(id, outcome),
                Ok(Reply::Later(future)) => self.detach(id, future),
                Err(payload) => self.settle(id, Err(ListenerError::from_panic(payload))),
            }

            if !listener.pending.swap(false, Ordering::AcqRel)
                || !self.listeners.lock().contains_key(&id)
            {
                break;
            }
            if redelivered == self.config.max_reentries {
                tracing::warn!(
                    registry = %self.config.name,
                    handle = %self.handle,
                    listener = %id,
                    redelivered,
                    "listener keeps writing back into its own cell; newest value not delivered"
                );
                break;
            }
            redelivered += 1;
        }
    }

    /// Hand a suspended listener invocation to the runtime.
    fn detach(&self, id: ListenerId, future: BoxFuture<'static, Outcome>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                registry = %self.config.name,
                handle = %self.handle,
                listener = %id,
                error = %ListenerError::NoRuntime,
                "suspended listener dropped"
            );
            return;
        };

        let cell = self.this.clone();
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(ListenerError::from_panic(payload)));

            // The handle may have died while the listener was suspended.
            if let Some(cell) = cell.upgrade() {
                cell.settle(id, outcome);
            }
        });
    }

    /// Apply a finished listener invocation's outcome.
    fn settle(&self, id: ListenerId, outcome: Outcome) {
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                if self.unsubscribe(id) {
                    tracing::debug!(
                        registry = %self.config.name,
                        handle = %self.handle,
                        listener = %id,
                        "listener stopped"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(
                    registry = %self.config.name,
                    handle = %self.handle,
                    listener = %id,
                    %error,
                    "listener fault"
                );
            }
        }
    }
}

impl<T: Data> ListenerSet for ValueCell<T> {
    fn remove(&self, id: ListenerId) -> bool {
        self.unsubscribe(id)
    }
}

impl<T> fmt::Debug for ValueCell<T>
where
    T: Data + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCell")
            .field("handle", &self.handle)
            .field("value", &*self.value.read())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn cell<T: Data>(initial: T) -> Arc<ValueCell<T>> {
        ValueCell::new(HandleId::new(), &initial, Arc::new(RegistryConfig::default()))
    }

    #[test]
    fn cell_read_and_write() {
        let cell = cell(0);
        assert_eq!(cell.read(), 0);

        assert!(cell.write(&42));
        assert_eq!(cell.read(), 42);
    }

    #[test]
    fn immediate_subscription_sees_current_value() {
        let cell = cell(7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        cell.subscribe(move |v| sink.lock().push(v), true);
        assert_eq!(*seen.lock(), vec![7]);

        cell.write(&8);
        assert_eq!(*seen.lock(), vec![7, 8]);
    }

    #[test]
    fn lazy_subscription_waits_for_write() {
        let cell = cell(7);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        cell.subscribe(
            move |_| {
                call_count_clone.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        cell.write(&1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let cell = cell(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let order = order.clone();
            cell.subscribe(move |_| order.lock().push(name), false);
        }

        cell.write(&1);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn stop_removes_only_that_listener() {
        let cell = cell(0);
        let stopper = Arc::new(AtomicI32::new(0));
        let other = Arc::new(AtomicI32::new(0));

        let stopper_clone = stopper.clone();
        cell.subscribe(
            move |_| {
                stopper_clone.fetch_add(1, Ordering::SeqCst);
                Flow::Stop
            },
            false,
        );
        let other_clone = other.clone();
        cell.subscribe(
            move |_| {
                other_clone.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        cell.write(&1);
        cell.write(&2);

        assert_eq!(stopper.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 2);
        assert_eq!(cell.listener_count(), 1);
    }

    #[test]
    fn faulty_listener_stays_subscribed() {
        let cell = cell(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        cell.subscribe(
            move |v: i32| -> Result<(), String> {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                if v == 1 {
                    Err("odd".into())
                } else {
                    Ok(())
                }
            },
            false,
        );

        cell.write(&1);
        cell.write(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_reach_writer() {
        let cell = cell(0);
        let after = Arc::new(AtomicI32::new(0));
        let after_clone = after.clone();

        cell.subscribe(|v: i32| if v > 0 { panic!("listener blew up") }, false);
        cell.subscribe(
            move |_| {
                after_clone.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert!(cell.write(&1));
        assert!(cell.write(&2));
        assert_eq!(after.load(Ordering::SeqCst), 2);
        assert_eq!(cell.listener_count(), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let cell = cell(0);
        let id = cell.subscribe(|_| {}, false);

        assert!(cell.unsubscribe(id));
        assert!(!cell.unsubscribe(id));
        assert_eq!(cell.listener_count(), 0);
    }

    #[test]
    fn listener_unsubscribed_mid_burst_is_skipped() {
        let cell = cell(0);
        let late = Arc::new(AtomicI32::new(0));
        let victim = Arc::new(Mutex::new(None::<ListenerId>));

        let cell_ref = Arc::downgrade(&cell);
        let victim_clone = victim.clone();
        cell.subscribe(
            move |_| {
                if let (Some(cell), Some(id)) = (cell_ref.upgrade(), *victim_clone.lock()) {
                    cell.unsubscribe(id);
                }
            },
            false,
        );
        let late_clone = late.clone();
        let id = cell.subscribe(
            move |_| {
                late_clone.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        *victim.lock() = Some(id);

        cell.write(&1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn self_write_is_delivered_after_the_running_call() {
        let cell = cell(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let depth_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let depth_sink = depth_seen.clone();
        let cell_ref = Arc::downgrade(&cell);

        cell.subscribe(
            move |v: i32| {
                sink.lock().push(v);
                depth_sink.lock().push(DispatchContext::depth());
                if let Some(cell) = cell_ref.upgrade() {
                    if v < 5 {
                        cell.write(&(v + 1));
                    }
                }
            },
            false,
        );

        cell.write(&1);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
        // Redelivery happens in the outer call, not nested inside the write.
        assert_eq!(*depth_seen.lock(), vec![1; 5]);
        assert_eq!(cell.read(), 5);
    }

    #[test]
    fn endless_self_write_is_cut_off() {
        let cell = ValueCell::new(
            HandleId::new(),
            &0,
            Arc::new(RegistryConfig::default().with_max_reentries(4)),
        );
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let cell_ref = Arc::downgrade(&cell);

        cell.subscribe(
            move |v: i32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                if let Some(cell) = cell_ref.upgrade() {
                    cell.write(&(v + 1));
                }
            },
            false,
        );

        cell.write(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(cell.read(), 6);
        assert_eq!(cell.listener_count(), 1);
    }

    #[test]
    fn other_listeners_still_see_self_writes() {
        let cell = cell(0);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let cell_ref = Arc::downgrade(&cell);

        cell.subscribe(
            move |v: i32| {
                if let Some(cell) = cell_ref.upgrade() {
                    if v == 1 {
                        cell.write(&2);
                    }
                }
            },
            false,
        );
        let sink = observed.clone();
        cell.subscribe(move |v: i32| sink.lock().push(v), false);

        cell.write(&1);
        // The nested write reaches the second listener first, then the outer
        // write's turn hands it the value current by then.
        assert_eq!(*observed.lock(), vec![2, 2]);
    }

    #[tokio::test]
    async fn suspended_listener_stop_is_applied_later() {
        let cell = cell(0);
        let (tx, rx) = tokio::sync::oneshot::channel::<i32>();
        let mut tx = Some(tx);

        cell.subscribe(
            move |v: i32| {
                let tx = tx.take();
                Reply::later(async move {
                    tokio::task::yield_now().await;
                    if let Some(tx) = tx {
                        let _ = tx.send(v);
                    }
                    Flow::Stop
                })
            },
            false,
        );

        assert!(cell.write(&3));
        // The write returned before the listener finished.
        assert_eq!(cell.listener_count(), 1);

        assert_eq!(rx.await.unwrap(), 3);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cell.listener_count(), 0);
    }
}
