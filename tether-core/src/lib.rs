//! Tether Core
//!
//! This crate provides reactive value containers: units of mutable state
//! that can be read, written, subscribed to, and combined into derived
//! values, with deterministic teardown once nothing holds the end of a
//! chain. It implements:
//!
//! - Value cells with deep-clone isolation and synchronous broadcast
//! - Handles, setters and awaitable conditions on top of them
//! - A liveness registry that runs death callbacks exactly once
//! - Derived handles that keep their sources alive and in sync
//!
//! # Architecture
//!
//! - `clone`: the [`DeepClone`] trait and the dynamic [`Value`] type
//! - `reactive`: cells, handles, listeners, the registry and derivations
//! - `config`: registry settings
//! - `error`: the crate error type
//!
//! # Example
//!
//! ```rust
//! use tether_core::Registry;
//!
//! let registry = Registry::new();
//! let (count, set_count) = registry.create(0);
//!
//! // A derived value
//! let doubled = registry.derive([("count", count.clone())], |v| v["count"] * 2);
//!
//! // A listener, called with the current value right away
//! count.subscribe(|n| println!("count is {n}"));
//!
//! set_count.set(5);
//! assert_eq!(doubled.value(), 10);
//!
//! // Dropping the last handle kills it; the setter reports failure after.
//! drop(count);
//! drop(doubled);
//! assert!(!set_count.set(6));
//! ```

pub mod clone;
pub mod config;
pub mod error;
pub mod reactive;

pub use clone::{DeepClone, Value};
pub use config::RegistryConfig;
pub use error::{Error, Result};
pub use reactive::{Flow, Handle, Registry, Reply, Setter, Unsubscribe};
