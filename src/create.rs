//! Creation Operations
//!
//! Entry points used by generated wrapper code right after (or instead of) a
//! driver create call.
//!
//! | Function                 | Ownership   | Existing live entry          |
//! |--------------------------|-------------|------------------------------|
//! | [`Handle::create`]       | `Managed`   | collision (asserts in debug) |
//! | [`Handle::create_with`]  | `Managed`   | collision (asserts in debug) |
//! | [`Handle::get_or_create`]| `Managed`   | joined                       |
//! | [`Handle::wrap_unmanaged`]| `Unmanaged`| collision (asserts in debug) |
//! | [`Handle::acquire_or_wrap`]| `Unmanaged` if new | joined              |
//!
//! Failure statuses:
//! - [`RegistryError::CreationFailed`]: the driver call failed; nothing exists.
//! - [`RegistryError::InitializationFailed`]: the driver object exists but
//!   its control block could not be built. The caller must destroy the raw
//!   object itself.

use std::fmt;

use crate::control_block::{ControlBlock, ControlBlockCell, Ownership};
use crate::errors::{RegistryError, Result};
use crate::handle::Handle;
use crate::identity::{IdentityKey, RawHandle};
use crate::kind::ResourceKind;

type CreateInfo<K> = <<K as ResourceKind>::ControlBlock as ControlBlock>::CreateInfo;

/// Status code returned by driver entry points.
///
/// Negative values are errors, `0` is success, positive values are
/// non-error informational statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(1);
    pub const TIMEOUT: Self = Self(2);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-1);
    pub const OUT_OF_DEVICE_MEMORY: Self = Self(-2);
    pub const INITIALIZATION_FAILED: Self = Self(-3);
    pub const DEVICE_LOST: Self = Self(-4);

    #[inline]
    #[must_use]
    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Converts to a `Result`, treating every non-negative status as success.
    #[inline]
    pub fn result(self) -> std::result::Result<(), DriverStatus> {
        if self.is_error() { Err(self) } else { Ok(()) }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "SUCCESS",
            Self::NOT_READY => "NOT_READY",
            Self::TIMEOUT => "TIMEOUT",
            Self::OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::INITIALIZATION_FAILED => "ERROR_INITIALIZATION_FAILED",
            Self::DEVICE_LOST => "ERROR_DEVICE_LOST",
            _ => return None,
        })
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl<K: ResourceKind> Handle<K> {
    /// Builds, populates and publishes a managed control block for an object
    /// the driver just created.
    pub fn create(identity: K::Identity, info: CreateInfo<K>) -> Result<Self> {
        let cell = build_cell::<K>(identity, Ownership::Managed, info)?;
        K::registry().publish(identity, cell)
    }

    /// Runs the driver's create call, then [`create`](Self::create)s the
    /// handle for the raw value it returned.
    ///
    /// `parent` must be the ancestor raw value for scoped kinds and `None`
    /// otherwise; this is checked before the driver is called.
    pub fn create_with<F>(parent: Option<RawHandle>, driver_create: F, info: CreateInfo<K>) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<RawHandle, DriverStatus>,
    {
        match (K::Identity::SCOPED, parent.is_some()) {
            (true, false) => return Err(RegistryError::MissingParent { kind: K::NAME }),
            (false, true) => return Err(RegistryError::UnexpectedParent { kind: K::NAME }),
            _ => {}
        }

        let raw = driver_create().map_err(|status| RegistryError::CreationFailed { kind: K::NAME, status })?;
        let identity = K::Identity::from_parts(K::NAME, parent, raw)?;
        Self::create(identity, info)
    }

    /// Returns the live handle for `identity`, or creates a managed one from
    /// `info` if none exists. `info` is only evaluated when creating.
    pub fn get_or_create<F>(identity: K::Identity, info: F) -> Result<Self>
    where
        F: FnOnce() -> CreateInfo<K>,
    {
        K::registry().get_or_create(identity, || ControlBlockCell::build(Ownership::Managed, info()))
    }

    /// Tracks an object this library did not create and must never destroy.
    pub fn wrap_unmanaged(identity: K::Identity, info: CreateInfo<K>) -> Result<Self> {
        let cell = build_cell::<K>(identity, Ownership::Unmanaged, info)?;
        K::registry().publish(identity, cell)
    }

    /// References a tracked object, falling back to an unmanaged wrapper
    /// when the object is unknown (e.g. handed in by the host environment).
    pub fn acquire_or_wrap<F>(identity: K::Identity, info: F) -> Result<Self>
    where
        F: FnOnce() -> CreateInfo<K>,
    {
        K::registry().get_or_create(identity, || ControlBlockCell::build(Ownership::Unmanaged, info()))
    }
}

fn build_cell<K: ResourceKind>(
    identity: K::Identity,
    ownership: Ownership,
    info: CreateInfo<K>,
) -> Result<ControlBlockCell<K::ControlBlock>> {
    ControlBlockCell::build(ownership, info).map_err(|err| RegistryError::InitializationFailed {
        kind: K::NAME,
        identity: identity.to_string(),
        reason: err.to_string(),
    })
}
