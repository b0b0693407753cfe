//! Registry Settings & Teardown Policy
//!
//! Each resource kind's registry is configured once, when its per-kind static
//! is first touched. A kind overrides the defaults through
//! `ResourceKind::settings`.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use vkshare::{RegistrySettings, TeardownPolicy};
//!
//! // Default: teardown runs under the kind's lock
//! let settings = RegistrySettings::default();
//!
//! // Slow destroy calls: release the lock first, block recreation with a tombstone
//! let settings = RegistrySettings::default()
//!     .with_teardown(TeardownPolicy::Deferred)
//!     .with_initial_capacity(1024);
//! ```

// ---------------------------------------------------------------------------
// TeardownPolicy
// ---------------------------------------------------------------------------

/// When the external destroy call runs relative to the kind's lock.
///
/// | Policy       | Lock held during teardown | Recreation of the same identity         |
/// |--------------|---------------------------|-----------------------------------------|
/// | `UnderLock`  | yes                       | serialized behind the lock              |
/// | `Deferred`   | no                        | waits on the tombstone until it clears  |
///
/// With either policy the identity cannot be published again before the
/// destroy call has returned. `acquire` on a tombstoned identity reports
/// `RegistryError::TearingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownPolicy {
    /// Erase and tear down inside the critical section of the final release.
    ///
    /// The teardown may clone or drop handles of its own kind; those are
    /// applied before the lock is released. Other calls into the same
    /// registry fail with `RegistryError::Reentrant`.
    #[default]
    UnderLock,

    /// Replace the entry with a tombstone, drop the lock, tear down, then
    /// clear the tombstone and wake any waiting creators.
    Deferred,
}

// ---------------------------------------------------------------------------
// RegistrySettings
// ---------------------------------------------------------------------------

/// Per-kind registry configuration.
///
/// # Fields
///
/// | Field              | Description                                   | Default     |
/// |--------------------|-----------------------------------------------|-------------|
/// | `teardown`         | When teardown runs relative to the lock       | `UnderLock` |
/// | `initial_capacity` | Pre-allocated map slots                       | `0`         |
/// | `trace_lifecycle`  | Emit `trace!` lines for publish / teardown    | `false`     |
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrySettings {
    /// Teardown synchronization, see [`TeardownPolicy`].
    pub teardown: TeardownPolicy,

    /// Number of entries the map reserves up front.
    ///
    /// Kinds with many short-lived objects (descriptor sets, command buffers)
    /// benefit from a larger value.
    pub initial_capacity: usize,

    /// Log every publish, acquire-miss and teardown at `trace` level.
    ///
    /// Teardown failures and invariant breaks are logged regardless.
    pub trace_lifecycle: bool,
}

impl RegistrySettings {
    #[inline]
    #[must_use]
    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_trace_lifecycle(mut self, trace_lifecycle: bool) -> Self {
        self.trace_lifecycle = trace_lifecycle;
        self
    }
}
