//! Deep Cloning
//!
//! Every value that enters or leaves a reactive cell passes through
//! [`DeepClone`]. The goal is isolation: the copy a reader receives and the
//! copy the cell keeps must never share mutable substructure.
//!
//! # Rules
//!
//! For statically typed data the rules fall out of ownership:
//!
//! - Scalars and strings are copied.
//! - Sequences, maps and sets are rebuilt element by element.
//! - `Box<T>` and `Arc<T>` get a fresh allocation around a deep clone of the
//!   pointee, so two cells never end up behind the same `Arc`.
//!
//! For dynamically shaped data use [`Value`], which also covers the
//! special cases: functions and opaque objects are shared rather than cloned,
//! and opaque objects that cannot clone themselves emit a diagnostic unless
//! they opt out.
//!
//! Deep cloning never fails. Anything that cannot be copied is shared.

mod value;

pub use value::{Callable, ErrorValue, Opaque, Value};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use indexmap::{IndexMap, IndexSet};

/// Produce a copy that shares no mutable substructure with the original.
///
/// This is deliberately separate from [`Clone`]: `Clone` on an `Arc` bumps a
/// reference count, `DeepClone` on an `Arc` copies what is behind it.
pub trait DeepClone {
    /// Return an independent copy of `self`.
    fn deep_clone(&self) -> Self;
}

/// Deep clone a value. Shorthand for [`DeepClone::deep_clone`].
pub fn deep_clone<T: DeepClone>(value: &T) -> T {
    value.deep_clone()
}

/// Implement [`DeepClone`] by delegating to [`Clone`].
///
/// Only correct for types whose `Clone` already owns all of its data, i.e.
/// types without `Arc`, `Rc` or interior mutability inside.
///
/// ```rust
/// use tether_core::deep_clone_via_clone;
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// deep_clone_via_clone!(Point);
/// ```
#[macro_export]
macro_rules! deep_clone_via_clone {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::DeepClone for $ty {
                #[inline]
                fn deep_clone(&self) -> Self {
                    ::std::clone::Clone::clone(self)
                }
            }
        )*
    };
}

deep_clone_via_clone!(
    (), bool, char,
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    String, &'static str,
    Duration, Instant, SystemTime,
);

impl<T: DeepClone> DeepClone for Option<T> {
    fn deep_clone(&self) -> Self {
        self.as_ref().map(DeepClone::deep_clone)
    }
}

impl<T: DeepClone, E: DeepClone> DeepClone for Result<T, E> {
    fn deep_clone(&self) -> Self {
        match self {
            Ok(value) => Ok(value.deep_clone()),
            Err(err) => Err(err.deep_clone()),
        }
    }
}

impl<T: DeepClone> DeepClone for Box<T> {
    fn deep_clone(&self) -> Self {
        Box::new((**self).deep_clone())
    }
}

impl<T: DeepClone> DeepClone for Arc<T> {
    fn deep_clone(&self) -> Self {
        Arc::new((**self).deep_clone())
    }
}

impl<T: DeepClone> DeepClone for Rc<T> {
    fn deep_clone(&self) -> Self {
        Rc::new((**self).deep_clone())
    }
}

impl DeepClone for Arc<str> {
    fn deep_clone(&self) -> Self {
        Arc::from(&**self)
    }
}

impl<T: DeepClone> DeepClone for Vec<T> {
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

impl<T: DeepClone> DeepClone for VecDeque<T> {
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

impl<T: DeepClone, const N: usize> DeepClone for [T; N] {
    fn deep_clone(&self) -> Self {
        std::array::from_fn(|i| self[i].deep_clone())
    }
}

impl<K, V, S> DeepClone for HashMap<K, V, S>
where
    K: DeepClone + Eq + Hash,
    V: DeepClone,
    S: BuildHasher + Default,
{
    fn deep_clone(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.deep_clone(), v.deep_clone()))
            .collect()
    }
}

impl<T, S> DeepClone for HashSet<T, S>
where
    T: DeepClone + Eq + Hash,
    S: BuildHasher + Default,
{
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

impl<K: DeepClone + Ord, V: DeepClone> DeepClone for BTreeMap<K, V> {
    fn deep_clone(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.deep_clone(), v.deep_clone()))
            .collect()
    }
}

impl<T: DeepClone + Ord> DeepClone for BTreeSet<T> {
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

impl<K, V, S> DeepClone for IndexMap<K, V, S>
where
    K: DeepClone + Eq + Hash,
    V: DeepClone,
    S: BuildHasher + Default,
{
    fn deep_clone(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.deep_clone(), v.deep_clone()))
            .collect()
    }
}

impl<T, S> DeepClone for IndexSet<T, S>
where
    T: DeepClone + Eq + Hash,
    S: BuildHasher + Default,
{
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

macro_rules! deep_clone_tuple {
    ($($name:ident),+) => {
        impl<$($name: DeepClone),+> DeepClone for ($($name,)+) {
            #[allow(non_snake_case)]
            fn deep_clone(&self) -> Self {
                let ($($name,)+) = self;
                ($($name.deep_clone(),)+)
            }
        }
    };
}

deep_clone_tuple!(A);
deep_clone_tuple!(A, B);
deep_clone_tuple!(A, B, C);
deep_clone_tuple!(A, B, C, D);
deep_clone_tuple!(A, B, C, D, E);

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
