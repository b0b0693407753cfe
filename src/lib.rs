//! # vkshare
//!
//! Reference-counted, identity-safe handles to objects owned by an external
//! driver.
//!
//! Drivers name their objects with plain integers, recycle those integers
//! after destruction, and (for non-dispatchable kinds) may hand out the same
//! integer under two different parents at the same time. This crate gives
//! each resource kind a value-type [`Handle`] that can be cloned, compared,
//! hashed and dropped freely, while a per-kind [`Registry`] guarantees:
//!
//! - at most one live control block per identity,
//! - exactly one teardown, when the last handle goes away,
//! - teardown with the right parent context,
//! - no races, double frees or stale resurrections across threads.
//!
//! ## Modules
//!
//! - [`identity`]: `Dispatchable` and `Scoped` identities
//! - [`registry`]: the per-kind refcount table
//! - [`handle`]: the value type applications hold
//! - [`control_block`]: per-kind state, lifecycle and teardown
//! - [`kind`]: resource kind trait and `define_resource_kind!`
//! - [`create`]: creation entry points and driver status codes
//! - [`address_map`]: device-address side table
//! - [`settings`]: per-kind registry configuration
//! - [`errors`]: error types

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

/// Logs a broken registry invariant and aborts debug builds.
///
/// Release builds keep going with the most conservative recovery the caller
/// implements.
macro_rules! invariant_violation {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        }
    }};
}

pub mod address_map;
pub mod control_block;
pub mod create;
pub mod errors;
pub mod handle;
pub mod identity;
pub mod kind;
pub mod registry;
pub mod settings;

pub use address_map::{AddressHit, AddressMap, AddressMapError};
pub use control_block::{ControlBlock, ControlBlockCell, Lifecycle, Ownership};
pub use create::DriverStatus;
pub use errors::{InitError, RegistryError, Result, TeardownError};
pub use handle::Handle;
pub use identity::{Dispatchable, IdentityKey, RawHandle, Scoped};
pub use kind::ResourceKind;
pub use registry::{ReadOnlyBlock, Registry, RegistryReport};
pub use settings::{RegistrySettings, TeardownPolicy};

#[doc(hidden)]
pub use paste as __paste;
