//! Per-kind Handle Registry
//!
//! Maps an identity to its reference count and shared control block. There is
//! one registry per resource kind, each behind its own lock, so unrelated kinds
//! never contend.
//!
//! # Invariants
//!
//! - An entry is live iff its refcount is greater than zero. The decrement
//!   that reaches zero removes the entry (or turns it into a tombstone) in the
//!   same critical section.
//! - At most one control block is live per identity: a creator reserves the
//!   identity with a `Creating` slot before it builds the block, and every
//!   other creator, acquirer or publisher of that identity waits for the slot
//!   to settle.
//! - An identity cannot be published again until the previous object's
//!   teardown has returned (see [`TeardownPolicy`]).
//! - No caller-supplied code runs under the lock except an `UnderLock`
//!   teardown. Handle clones and drops made by such a teardown on its own
//!   kind are queued and applied before the lock is released.
//!
//! Handles drive the refcount; the registry's own API only hands out handles,
//! never bare control blocks that could outlive their entry.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::control_block::{ControlBlockCell, Lifecycle, Ownership};
use crate::errors::{InitError, RegistryError, Result, TeardownError};
use crate::handle::Handle;
use crate::kind::ResourceKind;
use crate::settings::{RegistrySettings, TeardownPolicy};

type Cell<K> = ControlBlockCell<<K as ResourceKind>::ControlBlock>;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Non-zero per-thread token, used to recognise a thread re-entering a
/// registry it is already working inside.
fn thread_token() -> u64 {
    thread_local! {
        static TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

enum Slot<K: ResourceKind> {
    Live { refcount: u32, cell: Arc<Cell<K>> },
    /// Reserved by the thread `owner` while it builds the block unlocked.
    Creating { owner: u64 },
    /// Refcount reached zero; `owner` is running the destroy call unlocked.
    Tombstone { owner: u64 },
}

/// Refcount change made by an `UnderLock` teardown on its own kind.
enum Nested<K: ResourceKind> {
    Retain(K::Identity),
    Release(K::Identity, Arc<Cell<K>>),
}

struct Inner<K: ResourceKind> {
    slots: FxHashMap<K::Identity, Slot<K>>,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    published: u64,
    torn_down: u64,
    teardown_failures: u64,
    collisions: u64,
}

/// Snapshot of a registry's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryReport {
    /// Entries with at least one live handle
    pub live: usize,
    /// Identities reserved by a creator that is still building the block
    pub pending_creation: usize,
    /// Entries whose deferred teardown is still running
    pub pending_teardown: usize,
    /// Sum of all live refcounts
    pub references: u64,
    /// Control blocks ever published
    pub published: u64,
    /// Control blocks ever torn down (including unmanaged wrappers)
    pub torn_down: u64,
    /// Destroy calls that reported failure
    pub teardown_failures: u64,
    /// Publishes that found a live entry for the same identity
    pub collisions: u64,
}

impl RegistryReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0 && self.pending_creation == 0 && self.pending_teardown == 0
    }
}

/// Registry for one resource kind.
///
/// Normally reached through `K::registry()`, a per-kind static emitted by
/// [`define_resource_kind!`](crate::define_resource_kind). Handles remember
/// the registry that issued them and release into it, so operations that
/// hand out handles need a `&'static` registry. A registry built by hand
/// must therefore be stored in a static or leaked.
pub struct Registry<K: ResourceKind> {
    inner: Mutex<Inner<K>>,
    /// Signalled whenever a `Creating` or `Tombstone` slot settles.
    settled: Condvar,
    /// Token of the thread running an `UnderLock` teardown, `0` otherwise.
    teardown_owner: AtomicU64,
    nested: Mutex<Vec<Nested<K>>>,
    settings: RegistrySettings,
}

impl<K: ResourceKind> Default for Registry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ResourceKind> Registry<K> {
    /// Creates a registry configured by `K::settings()`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(K::settings())
    }

    #[must_use]
    pub fn with_settings(settings: RegistrySettings) -> Self {
        let slots = FxHashMap::with_capacity_and_hasher(settings.initial_capacity, Default::default());
        Self {
            inner: Mutex::new(Inner {
                slots,
                stats: Stats::default(),
            }),
            settled: Condvar::new(),
            teardown_owner: AtomicU64::new(0),
            nested: Mutex::new(Vec::new()),
            settings,
        }
    }

    #[inline]
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    #[inline]
    pub fn kind_name(&self) -> &'static str {
        K::NAME
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Returns a handle to the live entry for `identity`, creating it with
    /// `factory` if there is none.
    ///
    /// The identity is reserved before `factory` runs, and the factory runs
    /// without the kind's lock. Racing callers for the same identity wait for
    /// the reservation and then join the new entry. A failing factory leaves
    /// the registry untouched.
    ///
    /// The factory may clone, look up or drop handles of this kind. Asking
    /// for `identity` itself from inside the factory fails with
    /// [`RegistryError::RecursiveCreation`].
    pub fn get_or_create<F>(&'static self, identity: K::Identity, factory: F) -> Result<Handle<K>>
    where
        F: FnOnce() -> std::result::Result<Cell<K>, InitError>,
    {
        let token = thread_token();
        {
            let mut guard = self.lock_settled(identity, true)?;
            if let Some(Slot::Live { refcount, cell }) = guard.slots.get_mut(&identity) {
                *refcount += 1;
                return Ok(Handle::adopt(self, identity, Arc::clone(cell)));
            }
            guard.slots.insert(identity, Slot::Creating { owner: token });
        }

        let reservation = SlotReservation::new(self, identity);
        let built = factory();

        let mut guard = self.inner.lock();
        debug_assert!(matches!(
            guard.slots.get(&identity),
            Some(Slot::Creating { owner }) if *owner == token
        ));
        let result = match built {
            Ok(cell) => Ok(self.insert_locked(&mut guard, identity, cell)),
            Err(err) => {
                guard.slots.remove(&identity);
                Err(RegistryError::InitializationFailed {
                    kind: K::NAME,
                    identity: identity.to_string(),
                    reason: err.to_string(),
                })
            }
        };
        drop(guard);
        reservation.settle();
        result
    }

    /// Publishes an initialized control block under `identity`.
    ///
    /// Publishing onto a live identity is a driver uniqueness violation. Debug
    /// builds assert; release builds keep the existing entry, discard the
    /// candidate without tearing it down and return a handle to the existing
    /// entry.
    pub fn publish(&'static self, identity: K::Identity, cell: Cell<K>) -> Result<Handle<K>> {
        let mut guard = self.lock_settled(identity, true)?;

        if let Some(Slot::Live { refcount, cell: existing }) = guard.slots.get_mut(&identity) {
            *refcount += 1;
            let handle = Handle::adopt(self, identity, Arc::clone(existing));
            guard.stats.collisions += 1;
            drop(guard);

            drop(cell);
            invariant_violation!("{} {identity} published while already live; keeping the existing entry", K::NAME);
            return Ok(handle);
        }

        Ok(self.insert_locked(&mut guard, identity, cell))
    }

    fn insert_locked(&'static self, inner: &mut Inner<K>, identity: K::Identity, cell: Cell<K>) -> Handle<K> {
        debug_assert_eq!(cell.lifecycle(), Lifecycle::Publishing);
        cell.mark_live();
        let cell = Arc::new(cell);
        inner.slots.insert(
            identity,
            Slot::Live {
                refcount: 1,
                cell: Arc::clone(&cell),
            },
        );
        inner.stats.published += 1;

        if self.settings.trace_lifecycle {
            log::trace!("{} {identity} published ({:?})", K::NAME, cell.ownership());
        }
        Handle::adopt(self, identity, cell)
    }

    /// Locks the registry, rejecting re-entry from an `UnderLock` teardown.
    fn lock(&self) -> Result<MutexGuard<'_, Inner<K>>> {
        if self.in_own_teardown() {
            return Err(RegistryError::Reentrant { kind: K::NAME });
        }
        Ok(self.inner.lock())
    }

    /// Locks the registry once `identity` has no creation in flight (and no
    /// teardown either, when `wait_for_teardown` is set).
    ///
    /// Waiting on a slot this thread owns would never end; that is reported
    /// as an error instead.
    fn lock_settled(&self, identity: K::Identity, wait_for_teardown: bool) -> Result<MutexGuard<'_, Inner<K>>> {
        let token = thread_token();
        let mut guard = self.lock()?;
        loop {
            let wait = match guard.slots.get(&identity) {
                Some(Slot::Creating { owner }) if *owner == token => {
                    return Err(RegistryError::RecursiveCreation {
                        kind: K::NAME,
                        identity: identity.to_string(),
                    });
                }
                Some(Slot::Tombstone { owner }) if *owner == token => {
                    return Err(RegistryError::TearingDown {
                        kind: K::NAME,
                        identity: identity.to_string(),
                    });
                }
                Some(Slot::Creating { .. }) => true,
                Some(Slot::Tombstone { .. }) => wait_for_teardown,
                Some(Slot::Live { .. }) | None => false,
            };
            if !wait {
                return Ok(guard);
            }
            self.settled.wait(&mut guard);
        }
    }

    /// Locks for a read-only query; re-entry is logged and yields `None`.
    fn lock_for_query(&self) -> Option<MutexGuard<'_, Inner<K>>> {
        match self.lock() {
            Ok(guard) => Some(guard),
            Err(err) => {
                log::warn!("{err}");
                None
            }
        }
    }

    #[inline]
    fn in_own_teardown(&self) -> bool {
        self.teardown_owner.load(Ordering::Relaxed) == thread_token()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Takes a new reference to the live entry for `identity`.
    ///
    /// Waits for a creation of `identity` that is in flight on another
    /// thread. Fails with [`RegistryError::NotFound`] when nothing is tracked
    /// under `identity`, and with [`RegistryError::TearingDown`] when its last
    /// reference was just released and teardown has not finished.
    pub fn acquire(&'static self, identity: K::Identity) -> Result<Handle<K>> {
        let mut guard = self.lock_settled(identity, false)?;
        match guard.slots.get_mut(&identity) {
            Some(Slot::Live { refcount, cell }) => {
                *refcount += 1;
                Ok(Handle::adopt(self, identity, Arc::clone(cell)))
            }
            Some(Slot::Tombstone { .. }) => Err(RegistryError::TearingDown {
                kind: K::NAME,
                identity: identity.to_string(),
            }),
            Some(Slot::Creating { .. }) | None => {
                drop(guard);
                if self.settings.trace_lifecycle {
                    log::trace!("{} {identity} acquire missed", K::NAME);
                }
                Err(RegistryError::NotFound {
                    kind: K::NAME,
                    identity: identity.to_string(),
                })
            }
        }
    }

    /// Peeks at the control block for `identity` without taking a reference.
    ///
    /// The kind's lock is held for as long as the returned guard lives, so
    /// keep it short and never call back into this registry while holding it.
    pub fn find_read_only(&self, identity: K::Identity) -> Option<ReadOnlyBlock<'_, K>> {
        MutexGuard::try_map(self.lock_for_query()?, |inner| match inner.slots.get_mut(&identity) {
            Some(Slot::Live { cell, .. }) => Some(cell),
            _ => None,
        })
        .ok()
        .map(|guard| ReadOnlyBlock { guard })
    }

    /// Current refcount of `identity`, or `None` if it has no live entry.
    pub fn ref_count(&self, identity: K::Identity) -> Option<u32> {
        match self.lock_for_query()?.slots.get(&identity) {
            Some(Slot::Live { refcount, .. }) => Some(*refcount),
            _ => None,
        }
    }

    pub fn contains(&self, identity: K::Identity) -> bool {
        self.lock_for_query()
            .is_some_and(|guard| matches!(guard.slots.get(&identity), Some(Slot::Live { .. })))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock_for_query().map_or(0, |guard| {
            guard
                .slots
                .values()
                .filter(|slot| matches!(slot, Slot::Live { .. }))
                .count()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn report(&self) -> RegistryReport {
        let Some(guard) = self.lock_for_query() else {
            return RegistryReport::default();
        };
        let mut report = RegistryReport {
            published: guard.stats.published,
            torn_down: guard.stats.torn_down,
            teardown_failures: guard.stats.teardown_failures,
            collisions: guard.stats.collisions,
            ..Default::default()
        };
        for slot in guard.slots.values() {
            match slot {
                Slot::Live { refcount, .. } => {
                    report.live += 1;
                    report.references += u64::from(*refcount);
                }
                Slot::Creating { .. } => report.pending_creation += 1,
                Slot::Tombstone { .. } => report.pending_teardown += 1,
            }
        }
        report
    }

    // ========================================================================
    // Refcount (driven by Handle)
    // ========================================================================

    /// Adds a reference for a handle being cloned.
    pub(crate) fn retain(&self, identity: K::Identity) {
        if self.in_own_teardown() {
            self.nested.lock().push(Nested::Retain(identity));
            return;
        }
        let mut guard = self.inner.lock();
        Self::increment(&mut guard, identity);
    }

    /// Drops one reference. The release that reaches zero erases the entry
    /// and tears the control block down.
    ///
    /// `cell` is the releasing handle's share of the block; it is dropped
    /// inside the critical section so that the final release always finds the
    /// registry's share to be the last one.
    pub(crate) fn release(&self, identity: K::Identity, cell: Arc<Cell<K>>) {
        if self.in_own_teardown() {
            self.nested.lock().push(Nested::Release(identity, cell));
            return;
        }
        let mut guard = self.inner.lock();
        if !Self::decrement(&mut guard, identity, cell) {
            return;
        }
        match self.settings.teardown {
            TeardownPolicy::UnderLock => self.teardown_under_lock(guard, identity),
            TeardownPolicy::Deferred => self.teardown_deferred(guard, identity),
        }
    }

    fn increment(inner: &mut Inner<K>, identity: K::Identity) {
        match inner.slots.get_mut(&identity) {
            Some(Slot::Live { refcount, .. }) => *refcount += 1,
            _ => invariant_violation!("{} {identity} cloned without a live entry", K::NAME),
        }
    }

    /// Returns `true` when the count reached zero; the entry is then still in
    /// the map, live with a zero count, for the caller to tear down.
    fn decrement(inner: &mut Inner<K>, identity: K::Identity, cell: Arc<Cell<K>>) -> bool {
        let remaining = match inner.slots.get_mut(&identity) {
            Some(Slot::Live { refcount, .. }) if *refcount > 0 => {
                *refcount -= 1;
                Some(*refcount)
            }
            _ => None,
        };
        drop(cell);
        match remaining {
            Some(0) => true,
            Some(_) => false,
            None => {
                invariant_violation!("{} {identity} released without a live entry (refcount underflow)", K::NAME);
                false
            }
        }
    }

    /// Erases and tears down `identity` while holding the lock.
    ///
    /// Clones and drops the teardown makes on this kind are queued by
    /// `retain`/`release` and applied here; any entry they bring to zero is
    /// torn down in the same critical section. Cells are dropped only after
    /// the lock is released.
    fn teardown_under_lock(&self, mut guard: MutexGuard<'_, Inner<K>>, identity: K::Identity) {
        let mut doomed = vec![identity];
        let mut finished = Vec::new();
        {
            let _owner = TeardownOwner::claim(self);
            while let Some(identity) = doomed.pop() {
                let Some(Slot::Live { cell: entry, .. }) = guard.slots.remove(&identity) else {
                    unreachable!("entry reached zero under this lock");
                };
                if let Some(mut owned) = self.unwrap_cell(identity, entry) {
                    let outcome = owned.teardown();
                    Self::record_teardown(&mut guard.stats, outcome.is_err());
                    finished.push((identity, outcome, owned));
                }

                let nested = std::mem::take(&mut *self.nested.lock());
                for op in nested {
                    match op {
                        Nested::Retain(id) => Self::increment(&mut guard, id),
                        Nested::Release(id, cell) => {
                            if Self::decrement(&mut guard, id, cell) {
                                doomed.push(id);
                            }
                        }
                    }
                }
            }
        }
        drop(guard);

        for (identity, outcome, owned) in finished {
            self.log_teardown(identity, &outcome);
            drop(owned);
        }
    }

    /// Tombstones `identity`, then tears it down with the lock released.
    fn teardown_deferred(&self, mut guard: MutexGuard<'_, Inner<K>>, identity: K::Identity) {
        let tombstone = Slot::Tombstone { owner: thread_token() };
        let Some(Slot::Live { cell: entry, .. }) = guard.slots.insert(identity, tombstone) else {
            unreachable!("entry reached zero under this lock");
        };
        drop(guard);

        let reservation = SlotReservation::new(self, identity);
        let outcome = self
            .unwrap_cell(identity, entry)
            .map(|mut owned| (owned.teardown(), owned));

        let mut guard = self.inner.lock();
        guard.slots.remove(&identity);
        if let Some((result, _)) = &outcome {
            Self::record_teardown(&mut guard.stats, result.is_err());
        }
        drop(guard);
        reservation.settle();

        if let Some((result, owned)) = outcome {
            self.log_teardown(identity, &result);
            drop(owned);
        }
    }

    fn unwrap_cell(&self, identity: K::Identity, entry: Arc<Cell<K>>) -> Option<Cell<K>> {
        let owned = Arc::into_inner(entry);
        if owned.is_none() {
            invariant_violation!("{} {identity} still shared at teardown; skipping destroy", K::NAME);
        }
        owned
    }

    fn record_teardown(stats: &mut Stats, failed: bool) {
        stats.torn_down += 1;
        if failed {
            stats.teardown_failures += 1;
        }
    }

    fn log_teardown(&self, identity: K::Identity, outcome: &std::result::Result<(), TeardownError>) {
        match outcome {
            Ok(()) if self.settings.trace_lifecycle => {
                log::trace!("{} {identity} torn down", K::NAME);
            }
            Ok(()) => {}
            Err(err) => log::warn!("{} {identity}: {err}; entry removed anyway", K::NAME),
        }
    }
}

/// Clears a `Creating` or `Tombstone` slot if the unlocked work it guards
/// unwinds, so waiters are not left blocked on it forever.
struct SlotReservation<'a, K: ResourceKind> {
    registry: &'a Registry<K>,
    identity: K::Identity,
    armed: bool,
}

impl<'a, K: ResourceKind> SlotReservation<'a, K> {
    fn new(registry: &'a Registry<K>, identity: K::Identity) -> Self {
        Self {
            registry,
            identity,
            armed: true,
        }
    }

    /// The slot was resolved under the lock; wake the waiters.
    fn settle(mut self) {
        self.armed = false;
        self.registry.settled.notify_all();
    }
}

impl<K: ResourceKind> Drop for SlotReservation<'_, K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = self.registry.inner.lock();
        if matches!(
            guard.slots.get(&self.identity),
            Some(Slot::Creating { .. } | Slot::Tombstone { .. })
        ) {
            guard.slots.remove(&self.identity);
        }
        drop(guard);
        log::error!("{} {} abandoned mid-creation or mid-teardown", K::NAME, self.identity);
        self.registry.settled.notify_all();
    }
}

/// Marks the current thread as running an `UnderLock` teardown.
struct TeardownOwner<'a, K: ResourceKind> {
    registry: &'a Registry<K>,
}

impl<'a, K: ResourceKind> TeardownOwner<'a, K> {
    fn claim(registry: &'a Registry<K>) -> Self {
        registry.teardown_owner.store(thread_token(), Ordering::Relaxed);
        Self { registry }
    }
}

impl<K: ResourceKind> Drop for TeardownOwner<'_, K> {
    fn drop(&mut self) {
        self.registry.teardown_owner.store(0, Ordering::Relaxed);
        // Only non-empty if a teardown unwound; those changes are lost with it.
        self.registry.nested.lock().clear();
    }
}

impl<K: ResourceKind> fmt::Debug for Registry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &K::NAME)
            .field("settings", &self.settings)
            .field("report", &self.report())
            .finish()
    }
}

/// Non-owning view of a live control block, returned by
/// [`Registry::find_read_only`].
///
/// Holds the kind's lock; the entry cannot be released while this exists.
pub struct ReadOnlyBlock<'a, K: ResourceKind> {
    guard: MappedMutexGuard<'a, Arc<Cell<K>>>,
}

impl<K: ResourceKind> ReadOnlyBlock<'_, K> {
    pub fn lifecycle(&self) -> Lifecycle {
        self.guard.lifecycle()
    }

    pub fn ownership(&self) -> Ownership {
        self.guard.ownership()
    }
}

impl<K: ResourceKind> Deref for ReadOnlyBlock<'_, K> {
    type Target = K::ControlBlock;

    fn deref(&self) -> &Self::Target {
        self.guard.block()
    }
}
