//! Error Types
//!
//! This module defines the error types returned by registry and handle operations.
//!
//! # Overview
//!
//! The main error type [`RegistryError`] covers the recoverable failure modes:
//! - Lookups of identities that have no live entry
//! - Control-block initialization failures during creation
//! - Failed driver creation calls
//! - Identity reconstruction contract violations
//! - Re-entry into a registry from its own factory or teardown, which would
//!   otherwise wait on itself
//!
//! True invariant breaks (refcount underflow, identity collision on publish)
//! are not represented here: they are logged and panic in debug builds.
//!
//! # Usage
//!
//! All fallible public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, RegistryError>`.
//!
//! ```rust,ignore
//! use vkshare::errors::{RegistryError, Result};
//!
//! fn lookup(raw: u64) -> Result<Device> {
//!     Device::lookup(None, raw)
//! }
//! ```

use thiserror::Error;

use crate::create::DriverStatus;

/// The main error type for registry and handle operations.
///
/// Every variant carries the name of the resource kind that produced it so
/// that log lines stay meaningful when many kinds share one code path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No live entry exists for the identity.
    ///
    /// Callers may fall back to an unmanaged wrapper when that is valid for
    /// the kind (see `Handle::acquire_or_wrap`).
    #[error("{kind} {identity} is not tracked by the registry")]
    NotFound {
        /// Resource kind name
        kind: &'static str,
        /// Rendered identity
        identity: String,
    },

    /// The entry's last reference was released and its teardown is still
    /// running (deferred teardown only).
    #[error("{kind} {identity} is being torn down")]
    TearingDown {
        /// Resource kind name
        kind: &'static str,
        /// Rendered identity
        identity: String,
    },

    /// The identity was requested again from inside its own creation (the
    /// factory building it asked for the same identity).
    #[error("{kind} {identity} requested again while this thread is creating it")]
    RecursiveCreation {
        /// Resource kind name
        kind: &'static str,
        /// Rendered identity
        identity: String,
    },

    /// A registry operation that needs the kind's lock was called from a
    /// teardown running under that same lock.
    #[error("{kind} registry used from inside one of its own teardowns")]
    Reentrant {
        /// Resource kind name
        kind: &'static str,
    },

    /// A fallible accessor was called on a null handle.
    #[error("null {kind} handle")]
    NullHandle {
        /// Resource kind name
        kind: &'static str,
    },

    // ========================================================================
    // Creation Errors
    // ========================================================================
    /// The driver object exists but its control block could not be
    /// initialized. The caller still owns the raw object and must destroy it.
    #[error("failed to initialize {kind} {identity}: {reason}")]
    InitializationFailed {
        /// Resource kind name
        kind: &'static str,
        /// Rendered identity
        identity: String,
        /// Human-readable cause reported by `populate` or `post_init`
        reason: String,
    },

    /// The driver's create call failed; nothing was created.
    #[error("driver failed to create {kind}: {status}")]
    CreationFailed {
        /// Resource kind name
        kind: &'static str,
        /// Status returned by the driver
        status: DriverStatus,
    },

    // ========================================================================
    // Identity Reconstruction Errors
    // ========================================================================
    /// A scoped kind was looked up by bare raw value.
    #[error("{kind} is scoped to a parent; a parent raw value is required")]
    MissingParent {
        /// Resource kind name
        kind: &'static str,
    },

    /// An independently unique kind was given a parent raw value.
    #[error("{kind} is independently unique; it takes no parent raw value")]
    UnexpectedParent {
        /// Resource kind name
        kind: &'static str,
    },
}

impl RegistryError {
    /// Returns `true` for the recoverable "nothing to reference" outcomes.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure reported by a control block's external teardown call.
///
/// Teardown failures are logged and counted; they are never retried and
/// never keep the entry alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("teardown failed: {status}")]
pub struct TeardownError {
    /// Status returned by the driver's destroy call
    pub status: DriverStatus,
}

impl TeardownError {
    #[inline]
    #[must_use]
    pub fn new(status: DriverStatus) -> Self {
        Self { status }
    }
}

/// Failure reported by `ControlBlock::populate` or `ControlBlock::post_init`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InitError(pub String);

impl InitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<DriverStatus> for InitError {
    fn from(status: DriverStatus) -> Self {
        Self(status.to_string())
    }
}

/// Alias for `Result<T, RegistryError>`.
pub type Result<T> = std::result::Result<T, RegistryError>;
