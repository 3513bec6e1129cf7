//! Escape analysis, scalar replacement and GC barrier lowering for a sea-of-nodes IR.
//!
//! The crate is organised around a single [`Compile`] context that owns the node graph, the
//! alias table and the active barrier policy. Passes take the context explicitly:
//!
//! - [`escape`] builds the connection graph, classifies every allocation and gives the
//!   scalar replaceable ones memory slices of their own.
//! - [`macro_expand`] removes scalar-replaceable allocations and eliminated locks, then lowers
//!   what remains, letting the [`barrier`] policy expand its own nodes.
#![deny(missing_docs)]

pub use cranelift_entity as entity;

pub mod arraycopy;
pub mod barrier;
pub mod compile;
pub mod escape;
pub mod ir;
pub mod kit;
pub mod macro_expand;
pub mod settings;
pub mod timing;

mod result;

pub use crate::compile::Compile;

/// Hash map keyed by IR entities and interned types.
pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
/// Hash set companion of [`FxHashMap`].
pub(crate) type FxHashSet<K> = hashbrown::HashSet<K, rustc_hash::FxBuildHasher>;
pub use crate::result::{OptoError, OptoResult, RetryReason};

/// Even when trace logging is disabled, the trace macro has a significant performance cost so we
/// disable it by default.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}

/// Dynamic check for whether trace logging is enabled.
#[macro_export]
macro_rules! trace_log_enabled {
    () => {
        cfg!(any(feature = "trace-log", debug_assertions))
            && ::log::log_enabled!(::log::Level::Trace)
    };
}
