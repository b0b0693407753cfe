//! Resource kinds
//!
//! A resource kind ties together an identity form, a control block shape and
//! the kind's registry. Kinds are known at compile time, so every kind is its
//! own marker type and all registry paths are monomorphic.
//!
//! Kinds are declared with [`define_resource_kind!`](crate::define_resource_kind):
//!
//! ```rust,ignore
//! vkshare::define_resource_kind! {
//!     /// Logical device.
//!     pub Device: Dispatchable => DeviceBlock;
//!     /// Image, unique within its device.
//!     pub Image: Scoped => ImageBlock, settings = RegistrySettings::default().with_initial_capacity(256);
//! }
//! ```
//!
//! This emits `DeviceKind` / `ImageKind` marker types, a per-kind static
//! registry for each, and the aliases `Device = Handle<DeviceKind>` and
//! `Image = Handle<ImageKind>`.

use crate::control_block::ControlBlock;
use crate::identity::IdentityKey;
use crate::registry::Registry;
use crate::settings::RegistrySettings;

/// Compile-time description of one resource kind.
pub trait ResourceKind: Sized + Send + Sync + 'static {
    /// Name used in logs and errors.
    const NAME: &'static str;

    /// `Dispatchable` for independently unique kinds, `Scoped` otherwise.
    type Identity: IdentityKey;

    type ControlBlock: ControlBlock;

    /// The process-wide registry of this kind.
    fn registry() -> &'static Registry<Self>;

    /// Configuration applied when the registry is first created.
    #[inline]
    fn settings() -> RegistrySettings {
        RegistrySettings::default()
    }
}

/// Declares resource kinds and their handle aliases.
///
/// Each declaration is `vis Name: IdentityType => ControlBlockType;`,
/// optionally followed by `, settings = expr` before the semicolon.
#[macro_export]
macro_rules! define_resource_kind {
    ($(
        $(#[$meta:meta])*
        $vis:vis $name:ident : $identity:ty => $block:ty $(, settings = $settings:expr)? ;
    )+) => {$(
        $crate::__paste::paste! {
            #[doc = concat!("Kind marker for [`", stringify!($name), "`] handles.")]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            $vis enum [<$name Kind>] {}

            impl $crate::ResourceKind for [<$name Kind>] {
                const NAME: &'static str = stringify!($name);
                type Identity = $identity;
                type ControlBlock = $block;

                fn registry() -> &'static $crate::Registry<Self> {
                    static REGISTRY: ::std::sync::OnceLock<$crate::Registry<[<$name Kind>]>> =
                        ::std::sync::OnceLock::new();
                    REGISTRY.get_or_init($crate::Registry::new)
                }

                $(
                    fn settings() -> $crate::RegistrySettings {
                        $settings
                    }
                )?
            }

            $(#[$meta])*
            $vis type $name = $crate::Handle<[<$name Kind>]>;
        }
    )+};
}
