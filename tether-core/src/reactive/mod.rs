//! Reactive Containers
//!
//! This module implements the reactive core: value cells, the handles that
//! expose them, the registry that tracks their liveness, and derived handles
//! built from other handles.
//!
//! # Concepts
//!
//! ## Handles
//!
//! A [`Handle`] is a container for mutable state. It can be read, subscribed
//! to, and awaited. Writes go through the [`Setter`] returned alongside it.
//! Every read returns a deep clone, so no caller ever aliases the stored
//! value.
//!
//! ## Listeners
//!
//! A listener receives every value its handle broadcasts, in subscription
//! order. It may answer [`Flow::Stop`] to unsubscribe, fail without being
//! removed, or suspend by returning [`Reply::later`]; the writer never waits
//! for a suspended listener.
//!
//! ## Derived Handles
//!
//! [`Registry::derive`] builds a handle from a keyed set of source handles
//! and a combining function. It recombines whenever any source changes.
//!
//! ## Liveness
//!
//! A handle is alive while any strong reference to it exists: a clone of the
//! handle, a pending `wait`, or a derived handle that uses it as a source.
//! When the last one is dropped the [`Registry`] runs the handle's death
//! callback, once. Derived handles use that callback to unsubscribe from and
//! let go of their sources, so a chain tears itself down from the tail.

mod cell;
mod context;
mod derive;
mod handle;
mod listener;
mod registry;

pub use cell::{Data, ValueCell};
pub use context::DispatchContext;
pub use derive::SourceKey;
pub use handle::{Handle, HandleId, Presence, Setter, Unsubscribe, WeakHandle};
pub use listener::{Flow, IntoOutcome, IntoReply, ListenerError, ListenerId, Outcome, Reply};
pub use registry::{DerivationKey, Registry};
