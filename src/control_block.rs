//! Control Blocks
//!
//! A control block holds the state of one live external object: the fields
//! accessor queries read, and whatever the kind's destroy call needs (for
//! scoped kinds this includes a handle to the parent the object must be
//! destroyed on).
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──initialize──▶ Publishing ──publish──▶ Live ──last release──▶ TearingDown ──▶ Gone
//! ```
//!
//! - `Uninitialized → Publishing`: `populate` and `post_init` ran; no other
//!   thread can see the block yet.
//! - `Publishing → Live`: the atomic insert into the registry.
//! - `Live → TearingDown → Gone`: the release that brings the refcount to
//!   zero runs the destroy call (skipped for unmanaged wrappers).
//!
//! Every transition happens once. A raw value recycled by the driver gets a
//! brand-new cell that starts again at `Uninitialized`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::errors::{InitError, TeardownError};

/// Per-kind state and teardown logic.
///
/// Implementations are normally emitted by the handle generator, one per
/// resource kind. The block starts as `Default::default()` and is filled by
/// [`populate`](Self::populate) before anyone else can observe it.
pub trait ControlBlock: Default + Send + Sync + 'static {
    /// Native creation parameters, as passed to the driver's create call.
    type CreateInfo;

    /// Copies creation parameters into the block. Runs once, before publish.
    fn populate(&mut self, info: Self::CreateInfo) -> Result<(), InitError>;

    /// Computes derived state after the generic fields are set.
    #[inline]
    fn post_init(&mut self) -> Result<(), InitError> {
        Ok(())
    }

    /// Calls the kind's external destroy routine. Runs once, after the last
    /// handle is gone. Never called for unmanaged wrappers.
    fn teardown(&mut self) -> Result<(), TeardownError>;
}

/// Whether this library is responsible for destroying the external object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Created through this library; teardown runs on the last release.
    Managed,
    /// Obtained from the host environment; tracked locally, never destroyed.
    Unmanaged,
}

/// Stage of a control block's lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    Uninitialized = 0,
    Publishing = 1,
    Live = 2,
    TearingDown = 3,
    Gone = 4,
}

impl Lifecycle {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Publishing,
            2 => Self::Live,
            3 => Self::TearingDown,
            _ => Self::Gone,
        }
    }
}

/// A control block together with its ownership and lifecycle stage.
///
/// Shared between the registry entry and every handle referencing it; the
/// block itself is only mutated before publish and during teardown, when the
/// cell is uniquely owned.
pub struct ControlBlockCell<C: ControlBlock> {
    block: C,
    ownership: Ownership,
    state: AtomicU8,
}

impl<C: ControlBlock> ControlBlockCell<C> {
    /// Creates a default-initialized, unpublished cell.
    #[must_use]
    pub fn new(ownership: Ownership) -> Self {
        Self {
            block: C::default(),
            ownership,
            state: AtomicU8::new(Lifecycle::Uninitialized as u8),
        }
    }

    /// Runs `populate` then `post_init`, moving the cell to `Publishing`.
    pub fn initialize(&mut self, info: C::CreateInfo) -> Result<(), InitError> {
        debug_assert_eq!(self.lifecycle(), Lifecycle::Uninitialized);
        self.block.populate(info)?;
        self.block.post_init()?;
        self.advance(Lifecycle::Uninitialized, Lifecycle::Publishing);
        Ok(())
    }

    /// Builds a cell and initializes it in one step.
    pub fn build(ownership: Ownership, info: C::CreateInfo) -> Result<Self, InitError> {
        let mut cell = Self::new(ownership);
        cell.initialize(info)?;
        Ok(cell)
    }

    #[inline]
    pub fn block(&self) -> &C {
        &self.block
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Marks the cell as visible in the registry.
    pub(crate) fn mark_live(&self) {
        self.advance(Lifecycle::Publishing, Lifecycle::Live);
    }

    /// Runs the destroy call for managed blocks and moves the cell to `Gone`.
    ///
    /// Requires unique ownership: every handle and the registry entry have
    /// already let go of the cell.
    pub(crate) fn teardown(&mut self) -> Result<(), TeardownError> {
        self.advance(Lifecycle::Live, Lifecycle::TearingDown);
        let result = match self.ownership {
            Ownership::Managed => self.block.teardown(),
            Ownership::Unmanaged => Ok(()),
        };
        self.advance(Lifecycle::TearingDown, Lifecycle::Gone);
        result
    }

    fn advance(&self, from: Lifecycle, to: Lifecycle) {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
        if let Err(actual) = swapped {
            let actual = Lifecycle::from_u8(actual);
            log::error!("control block transition {from:?} -> {to:?} attempted from {actual:?}");
        }
        debug_assert!(swapped.is_ok(), "control block transition {from:?} -> {to:?} out of order");
    }
}

impl<C: ControlBlock> Drop for ControlBlockCell<C> {
    fn drop(&mut self) {
        let state = self.lifecycle();
        if self.ownership == Ownership::Managed && matches!(state, Lifecycle::Live | Lifecycle::TearingDown) {
            log::error!("managed control block dropped in state {state:?}; external object leaked");
        }
    }
}
