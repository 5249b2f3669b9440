//! Listener types for the reactive system.
//!
//! A listener is a callback subscribed to a cell. It receives every value
//! the cell broadcasts and answers with a [`Reply`]: either an outcome right
//! away, or a future whose output is the outcome.
//!
//! Outcomes are [`Flow::Continue`], [`Flow::Stop`] (remove me) or a
//! [`ListenerError`]. A failing listener stays subscribed.

use std::any::Any;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;

/// Unique identifier for a listener.
///
/// Each subscription gets a unique ID, used to remove it again either
/// through an [`Unsubscribe`](super::Unsubscribe) or because the listener
/// answered [`Flow::Stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Whether a listener wants to keep receiving values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    /// The STOP signal: remove this listener from the cell.
    Stop,
}

/// A failure inside a listener invocation.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),

    #[error("listener panicked: {0}")]
    Panicked(String),

    #[error("listener suspended outside a tokio runtime and cannot be driven")]
    NoRuntime,
}

impl ListenerError {
    pub fn failed(reason: impl Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::Panicked(message)
    }
}

/// What a listener invocation produced once it finished.
pub type Outcome = Result<Flow, ListenerError>;

/// Conversion of a listener's result into an [`Outcome`].
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Ok(Flow::Continue)
    }
}

impl IntoOutcome for Flow {
    fn into_outcome(self) -> Outcome {
        Ok(self)
    }
}

impl<E: Display> IntoOutcome for Result<Flow, E> {
    fn into_outcome(self) -> Outcome {
        self.map_err(ListenerError::failed)
    }
}

impl<E: Display> IntoOutcome for Result<(), E> {
    fn into_outcome(self) -> Outcome {
        self.map(|()| Flow::Continue).map_err(ListenerError::failed)
    }
}

/// A listener's immediate answer to a notification.
pub enum Reply {
    /// The invocation completed synchronously.
    Now(Outcome),
    /// The invocation suspended; the future finishes it.
    Later(BoxFuture<'static, Outcome>),
}

impl Reply {
    /// Wrap a future as a suspended listener invocation.
    ///
    /// ```rust,ignore
    /// handle.subscribe(move |value| {
    ///     let tx = tx.clone();
    ///     Reply::later(async move {
    ///         tx.send(value).await.map(|_| Flow::Continue)
    ///     })
    /// });
    /// ```
    pub fn later<F>(future: F) -> Self
    where
        F: Future + Send + 'static,
        F::Output: IntoOutcome,
    {
        Reply::Later(Box::pin(async move { future.await.into_outcome() }))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Now(outcome) => f.debug_tuple("Now").field(outcome).finish(),
            Reply::Later(_) => f.write_str("Later(..)"),
        }
    }
}

/// Conversion of a listener's return value into a [`Reply`].
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply {
        self
    }
}

impl<O: IntoOutcome> IntoReply for O {
    fn into_reply(self) -> Reply {
        Reply::Now(self.into_outcome())
    }
}

/// A type-erased listener as stored by a cell.
///
/// The mutex serializes invocations of one listener; a cell never holds its
/// own locks while a listener runs. A notification that arrives while the
/// listener is busy sets `pending` and is delivered once the running call
/// returns.
pub(crate) struct ListenerSlot<T> {
    pub(crate) call: Mutex<Box<dyn FnMut(T) -> Reply + Send>>,
    pub(crate) pending: AtomicBool,
}

pub(crate) type SharedListener<T> = Arc<ListenerSlot<T>>;

pub(crate) fn share<T, F, R>(mut listener: F) -> SharedListener<T>
where
    T: 'static,
    F: FnMut(T) -> R + Send + 'static,
    R: IntoReply,
{
    let boxed: Box<dyn FnMut(T) -> Reply + Send> =
        Box::new(move |value: T| listener(value).into_reply());
    Arc::new(ListenerSlot {
        call: Mutex::new(boxed),
        pending: AtomicBool::new(false),
    })
}
