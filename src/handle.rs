//! Shared-Ownership Handles
//!
//! [`Handle<K>`] is the value type applications hold for a resource of kind
//! `K`. It behaves like a plain value (clone, compare, hash, drop) while the
//! per-kind registry counts references behind it.
//!
//! # Semantics
//!
//! | Operation          | Refcount effect                                  |
//! |--------------------|--------------------------------------------------|
//! | `Handle::default()`| none (null handle)                               |
//! | `clone()`          | +1 when non-null                                 |
//! | move / `take()`    | none; `take()` leaves the source null            |
//! | `reset()` / drop   | -1 when non-null; the last one tears down        |
//!
//! A handle caches a shared pointer to its control block, so field reads never
//! touch the registry lock. The registry's refcount, not the pointer count,
//! decides when teardown runs. A handle also remembers the registry that
//! issued it; clones and drops always go back to that registry.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::control_block::{ControlBlockCell, Lifecycle, Ownership};
use crate::errors::{RegistryError, Result};
use crate::identity::{IdentityKey, RawHandle};
use crate::kind::ResourceKind;
use crate::registry::Registry;

type Shared<K> = Arc<ControlBlockCell<<K as ResourceKind>::ControlBlock>>;

struct Reference<K: ResourceKind> {
    registry: &'static Registry<K>,
    identity: K::Identity,
    cell: Shared<K>,
}

/// Reference-counted handle to one external object of kind `K`.
pub struct Handle<K: ResourceKind> {
    inner: Option<Reference<K>>,
}

impl<K: ResourceKind> Handle<K> {
    /// The null handle.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self { inner: None }
    }

    /// Wraps a reference the registry has already counted.
    #[inline]
    pub(crate) fn adopt(registry: &'static Registry<K>, identity: K::Identity, cell: Shared<K>) -> Self {
        Self {
            inner: Some(Reference { registry, identity, cell }),
        }
    }

    /// Takes a new reference to the object tracked under `identity`.
    ///
    /// Fails exactly like [`Registry::acquire`](crate::Registry::acquire).
    pub fn from_identity(identity: K::Identity) -> Result<Self> {
        K::registry().acquire(identity)
    }

    /// Looks up an object by the raw values the driver handed back.
    ///
    /// Scoped kinds need the raw value of their independently unique ancestor
    /// to rebuild the full identity; passing `None` for them is reported as
    /// [`RegistryError::MissingParent`].
    pub fn lookup(parent: Option<RawHandle>, raw: RawHandle) -> Result<Self> {
        let identity = K::Identity::from_parts(K::NAME, parent, raw)?;
        Self::from_identity(identity)
    }

    // ========================================================================
    // State
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// `true` when the handle references an object.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Drops this handle's reference and leaves it null. A second call is a
    /// no-op.
    pub fn reset(&mut self) {
        if let Some(Reference { registry, identity, cell }) = self.inner.take() {
            registry.release(identity, cell);
        }
    }

    /// Moves the reference out, leaving `self` null. No refcount traffic.
    #[inline]
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            inner: self.inner.take(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn identity(&self) -> Option<K::Identity> {
        self.inner.as_ref().map(|reference| reference.identity)
    }

    /// The object's raw value, as passed to driver calls.
    ///
    /// # Panics
    /// Panics on a null handle.
    #[inline]
    pub fn raw(&self) -> RawHandle {
        self.expect_inner().identity.raw()
    }

    /// The raw value of the independently unique ancestor (scoped kinds only).
    ///
    /// # Panics
    /// Panics on a null handle.
    #[inline]
    pub fn parent_raw(&self) -> Option<RawHandle> {
        self.expect_inner().identity.parent_raw()
    }

    /// The control block's fields.
    ///
    /// # Panics
    /// Panics on a null handle.
    #[inline]
    pub fn block(&self) -> &K::ControlBlock {
        self.expect_inner().cell.block()
    }

    pub fn try_block(&self) -> Result<&K::ControlBlock> {
        self.inner
            .as_ref()
            .map(|reference| reference.cell.block())
            .ok_or(RegistryError::NullHandle { kind: K::NAME })
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.inner.as_ref().map(|reference| reference.cell.ownership())
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.inner.as_ref().map(|reference| reference.cell.lifecycle())
    }

    /// Number of handles sharing this object, or `None` for a null handle.
    pub fn ref_count(&self) -> Option<u32> {
        self.inner
            .as_ref()
            .and_then(|reference| reference.registry.ref_count(reference.identity))
    }

    fn expect_inner(&self) -> &Reference<K> {
        match &self.inner {
            Some(inner) => inner,
            None => panic!("accessed a null {} handle", K::NAME),
        }
    }
}

impl<K: ResourceKind> Default for Handle<K> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<K: ResourceKind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        match &self.inner {
            Some(reference) => {
                reference.registry.retain(reference.identity);
                Self::adopt(reference.registry, reference.identity, Arc::clone(&reference.cell))
            }
            None => Self::null(),
        }
    }
}

impl<K: ResourceKind> Drop for Handle<K> {
    fn drop(&mut self) {
        self.reset();
    }
}

// Comparisons look at the identity only: two handles are equal iff they
// reference the same object, and null handles sort first.

impl<K: ResourceKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl<K: ResourceKind> Eq for Handle<K> {}

impl<K: ResourceKind> PartialOrd for Handle<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: ResourceKind> Ord for Handle<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl<K: ResourceKind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl<K: ResourceKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity() {
            Some(identity) => write!(f, "{}({identity})", K::NAME),
            None => write!(f, "{}(null)", K::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_block::ControlBlock;
    use crate::errors::{InitError, TeardownError};
    use crate::identity::Dispatchable;
    use parking_lot::Mutex;

    static DESTROYED: Mutex<Vec<RawHandle>> = Mutex::new(Vec::new());

    fn destroyed(raw: RawHandle) -> usize {
        DESTROYED.lock().iter().filter(|&&r| r == raw).count()
    }

    #[derive(Default)]
    struct Fence {
        raw: RawHandle,
        signaled: bool,
    }

    impl ControlBlock for Fence {
        type CreateInfo = (RawHandle, bool);

        fn populate(&mut self, (raw, signaled): (RawHandle, bool)) -> std::result::Result<(), InitError> {
            self.raw = raw;
            self.signaled = signaled;
            Ok(())
        }

        fn teardown(&mut self) -> std::result::Result<(), TeardownError> {
            DESTROYED.lock().push(self.raw);
            Ok(())
        }
    }

    crate::define_resource_kind! {
        TestFence: Dispatchable => Fence;
    }

    fn create(raw: RawHandle, signaled: bool) -> TestFence {
        TestFence::create(Dispatchable::new(raw), (raw, signaled)).unwrap()
    }

    #[test]
    fn test_null_handle() {
        let handle = TestFence::default();
        assert!(handle.is_null());
        assert!(!handle.is_valid());
        assert_eq!(handle, TestFence::null());
        assert_eq!(handle.identity(), None);
        assert_eq!(handle.ref_count(), None);
        assert!(handle.try_block().is_err());
        assert_eq!(format!("{handle:?}"), "TestFence(null)");
    }

    #[test]
    #[should_panic(expected = "null TestFence handle")]
    fn test_null_accessor_panics() {
        let handle = TestFence::default();
        let _ = handle.raw();
    }

    #[test]
    fn test_clone_and_reset() {
        let mut a = create(0x100, true);
        assert!(a.block().signaled);
        assert_eq!(a.ref_count(), Some(1));

        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(b.ref_count(), Some(2));

        a.reset();
        a.reset();
        assert!(a.is_null());
        assert_eq!(b.ref_count(), Some(1));
    }

    #[test]
    fn test_take_moves_without_refcount_traffic() {
        let mut a = create(0x101, false);
        let b = a.take();
        assert!(a.is_null());
        assert_eq!(b.raw(), 0x101);
        assert_eq!(b.ref_count(), Some(1));
    }

    #[test]
    fn test_ordering_puts_null_first() {
        let a = create(0x102, false);
        let b = create(0x103, false);
        let mut handles = vec![b.clone(), TestFence::null(), a.clone()];
        handles.sort();
        assert!(handles[0].is_null());
        assert_eq!(handles[1], a);
        assert_eq!(handles[2], b);
    }

    #[test]
    fn test_drop_last_tears_down_once() {
        let a = create(0x104, false);
        let b = a.clone();
        drop(a);
        assert_eq!(destroyed(0x104), 0);
        drop(b);
        assert_eq!(destroyed(0x104), 1);
        assert!(TestFence::from_identity(Dispatchable::new(0x104)).is_err());
    }
}
