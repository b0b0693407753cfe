//! Resource identities
//!
//! An identity names exactly one external object. Drivers are free to recycle
//! raw handle values once an object is destroyed, and objects that are only
//! unique within a parent (a "scoped" kind) may share a raw value with an
//! unrelated object living under a different parent.
//!
//! # Forms
//!
//! | Kind                   | Identity                    | Ordering                  |
//! |------------------------|-----------------------------|---------------------------|
//! | Independently unique   | [`Dispatchable`]`(raw)`     | by `raw`                  |
//! | Scoped to a parent     | [`Scoped`]`{ parent, raw }` | lexicographic `(parent, raw)` |
//!
//! `parent` is the raw value of the nearest *independently unique* ancestor,
//! not of the immediate parent.
//!
//! Identities carry no ownership. The "no reference" state of a handle is an
//! `Option::None` around the identity, never a reserved raw value: `0` and
//! `u64::MAX` are legal values for some kinds.

use std::fmt;
use std::hash::Hash;

use crate::errors::{RegistryError, Result};

/// Raw integer value of a driver object, as handed out by the driver.
pub type RawHandle = u64;

/// Common interface of the identity forms.
///
/// Implemented by [`Dispatchable`] and [`Scoped`] only; a resource kind picks
/// one of the two as its `ResourceKind::Identity`.
pub trait IdentityKey:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// `true` for identities that need a parent component.
    const SCOPED: bool;

    /// The object's own raw value, as passed to driver calls.
    fn raw(&self) -> RawHandle;

    /// The raw value of the independently unique ancestor, for scoped kinds.
    fn parent_raw(&self) -> Option<RawHandle>;

    /// Rebuilds a full identity from raw values received from the driver.
    ///
    /// `kind` is only used to label the error.
    fn from_parts(kind: &'static str, parent: Option<RawHandle>, raw: RawHandle) -> Result<Self>;
}

// ---------------------------------------------------------------------------
// Dispatchable
// ---------------------------------------------------------------------------

/// Identity of an independently unique object: the raw value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dispatchable(RawHandle);

impl Dispatchable {
    #[inline]
    #[must_use]
    pub const fn new(raw: RawHandle) -> Self {
        Self(raw)
    }
}

impl IdentityKey for Dispatchable {
    const SCOPED: bool = false;

    #[inline]
    fn raw(&self) -> RawHandle {
        self.0
    }

    #[inline]
    fn parent_raw(&self) -> Option<RawHandle> {
        None
    }

    fn from_parts(kind: &'static str, parent: Option<RawHandle>, raw: RawHandle) -> Result<Self> {
        match parent {
            None => Ok(Self(raw)),
            Some(_) => Err(RegistryError::UnexpectedParent { kind }),
        }
    }
}

impl From<RawHandle> for Dispatchable {
    fn from(raw: RawHandle) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Dispatchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Scoped
// ---------------------------------------------------------------------------

/// Identity of an object whose raw value is only unique within its parent.
///
/// Field order matters: the derived `Ord` compares `parent` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scoped {
    parent: RawHandle,
    raw: RawHandle,
}

impl Scoped {
    #[inline]
    #[must_use]
    pub const fn new(parent: RawHandle, raw: RawHandle) -> Self {
        Self { parent, raw }
    }

    /// Builds the identity of a child of `parent`, inheriting its unique
    /// ancestor.
    ///
    /// A child of a dispatchable parent is scoped to that parent; a child of a
    /// scoped parent is scoped to the same ancestor as the parent.
    #[inline]
    #[must_use]
    pub fn child_of<P: IdentityKey>(parent: &P, raw: RawHandle) -> Self {
        Self {
            parent: parent.parent_raw().unwrap_or_else(|| parent.raw()),
            raw,
        }
    }

    /// The ancestor's raw value.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> RawHandle {
        self.parent
    }
}

impl IdentityKey for Scoped {
    const SCOPED: bool = true;

    #[inline]
    fn raw(&self) -> RawHandle {
        self.raw
    }

    #[inline]
    fn parent_raw(&self) -> Option<RawHandle> {
        Some(self.parent)
    }

    fn from_parts(kind: &'static str, parent: Option<RawHandle>, raw: RawHandle) -> Result<Self> {
        parent
            .map(|parent| Self { parent, raw })
            .ok_or(RegistryError::MissingParent { kind })
    }
}

impl fmt::Display for Scoped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.parent, self.raw)
    }
}
